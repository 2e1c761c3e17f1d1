//! Cauchy Reed-Solomon erasure code over GF(256)
//!
//! Systematic: the original blocks travel unchanged, parity blocks let the
//! receiver rebuild up to `fec_count` missing originals per slice.

pub mod decoder;
pub mod encoder;
pub mod gf;

pub use decoder::{DecoderStats, ErasureDecoder};
pub use encoder::{EncoderStats, ErasureEncoder, SliceEncoder};
