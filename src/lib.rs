//! # LAN I/Q Receiver
//!
//! Low-latency reception of an FEC-protected I/Q sample stream over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              SENDER                                         │
//! │   Slice N: [meta block 0][data 1 .. k-1][parity k .. k+m-1]                 │
//! │   One block per datagram: [Slice|Block|k|m|Width|Size|Payload]              │
//! └─────────────────────────────────────┬───────────────────────────────────────┘
//!                                       │ UDP (lossy, reordered)
//!                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              RECEIVER                                        │
//! │                                                                             │
//! │   ┌─────────────────┐     ┌────────────────────────────────────────────┐   │
//! │   │  Master Clock   │     │        Session Worker (single task)         │   │
//! │   │ (clock::tick)   │────▶│                                            │   │
//! │   └─────────────────┘     │  datagram ─▶ protocol::parse                │   │
//! │                           │               │                            │   │
//! │   ┌─────────────────┐     │               ▼                            │   │
//! │   │  UDP Socket     │────▶│  buffer::SliceAssembler (ring of slots)     │   │
//! │   │ (network::udp)  │     │               │ threshold reached          │   │
//! │   └─────────────────┘     │               ▼                            │   │
//! │                           │  codec::ErasureDecoder (Cauchy GF(256))     │   │
//! │                           │               │                            │   │
//! │                           │        tick   ▼                            │   │
//! │                           │  playout::Pacer ── skip / repeat / conceal  │   │
//! │                           └───────────────┬────────────────────────────┘   │
//! │                                           │ non-blocking push              │
//! │                                           ▼                                │
//! │                           ┌────────────────────────────────────────────┐   │
//! │                           │  playout::SampleSink (bounded queue)        │   │
//! │                           └────────────────────────────────────────────┘   │
//! │                                                                             │
//! │   control::ControlServer ── HTTP status / start / stop / reset             │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod playout;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default UDP data port
    pub const DEFAULT_DATA_PORT: u16 = 9090;

    /// Default HTTP control port
    pub const DEFAULT_HTTP_PORT: u16 = 8090;

    /// Default master clock period in milliseconds
    pub const DEFAULT_TICK_MS: u64 = 50;

    /// Default number of original blocks per slice (including the meta block)
    pub const DEFAULT_ORIGINAL_COUNT: u8 = 128;

    /// Default number of parity blocks per slice
    pub const DEFAULT_FEC_COUNT: u8 = 8;

    /// Default block payload size: 512 byte datagram minus header
    pub const DEFAULT_BLOCK_SIZE: usize = 504;

    /// Default number of slices in flight
    pub const DEFAULT_RING_DEPTH: usize = 16;

    /// Slice indices wrap at this value
    pub const SLICE_INDEX_MODULUS: u64 = 1 << 16;

    /// Upper bound on original + parity blocks (GF(256) symbol space)
    pub const MAX_TOTAL_BLOCKS: usize = 256;

    /// Ring depth must stay below half the slice index space
    pub const MAX_RING_DEPTH: usize = 1 << 15;

    /// Largest payload that fits a UDP datagram with our header
    pub const MAX_BLOCK_SIZE: usize = 65_507 - crate::protocol::HEADER_LEN;

    /// Bound on the accumulated playout budget, in slices
    pub const MAX_BUDGET_SLICES: f64 = 2.0;

    /// Maximum relative playout rate correction
    pub const MAX_RATE_CORRECTION: f64 = 0.05;
}
