//! Parity encoder and slice datagram builder
//!
//! `ErasureEncoder` computes parity blocks from the original blocks of one
//! slice. `SliceEncoder` turns metadata and raw sample bytes into the full
//! set of datagrams for a slice, ready to be sent.

use bytes::{Bytes, BytesMut};

use super::gf::{self, cauchy_element};
use crate::config::Geometry;
use crate::constants::MAX_TOTAL_BLOCKS;
use crate::error::DecodeError;
use crate::protocol::{BlockHeader, SliceMetadata, HEADER_LEN};

/// Systematic Cauchy Reed-Solomon encoder
pub struct ErasureEncoder {
    original_count: u8,
    fec_count: u8,
    block_size: usize,
    /// Slices encoded
    slices_encoded: u64,
    /// Parity bytes produced
    parity_bytes: u64,
}

impl ErasureEncoder {
    pub fn new(original_count: u8, fec_count: u8, block_size: usize) -> Result<Self, DecodeError> {
        if original_count == 0
            || block_size == 0
            || original_count as usize + fec_count as usize > MAX_TOTAL_BLOCKS
        {
            return Err(DecodeError::InvalidParams);
        }
        Ok(Self {
            original_count,
            fec_count,
            block_size,
            slices_encoded: 0,
            parity_bytes: 0,
        })
    }

    pub fn from_geometry(geometry: &Geometry) -> Result<Self, DecodeError> {
        Self::new(geometry.original_count, geometry.fec_count, geometry.block_size)
    }

    /// Compute parity row `row` into `out`
    pub fn encode_row<B: AsRef<[u8]>>(
        &self,
        originals: &[B],
        row: u8,
        out: &mut [u8],
    ) -> Result<(), DecodeError> {
        if row >= self.fec_count {
            return Err(DecodeError::InvalidParams);
        }
        self.check_originals(originals)?;
        if out.len() != self.block_size {
            return Err(DecodeError::BlockSize);
        }

        out.fill(0);
        let x_0 = self.original_count;
        let x_i = x_0 + row;
        for (j, original) in originals.iter().enumerate() {
            gf::mul_add_into(out, original.as_ref(), cauchy_element(x_i, x_0, j as u8));
        }
        Ok(())
    }

    /// Compute all parity blocks for one slice
    pub fn encode<B: AsRef<[u8]>>(&mut self, originals: &[B]) -> Result<Vec<Vec<u8>>, DecodeError> {
        self.check_originals(originals)?;

        let mut parity = vec![vec![0u8; self.block_size]; self.fec_count as usize];
        for (row, out) in parity.iter_mut().enumerate() {
            self.encode_row(originals, row as u8, out)?;
        }

        self.slices_encoded += 1;
        self.parity_bytes += (self.fec_count as usize * self.block_size) as u64;
        Ok(parity)
    }

    fn check_originals<B: AsRef<[u8]>>(&self, originals: &[B]) -> Result<(), DecodeError> {
        if originals.len() != self.original_count as usize {
            return Err(DecodeError::InsufficientBlocks {
                have: originals.len(),
                need: self.original_count as usize,
            });
        }
        if originals.iter().any(|b| b.as_ref().len() != self.block_size) {
            return Err(DecodeError::BlockSize);
        }
        Ok(())
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            slices_encoded: self.slices_encoded,
            parity_bytes: self.parity_bytes,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub slices_encoded: u64,
    pub parity_bytes: u64,
}

/// Builds the datagrams of consecutive slices
pub struct SliceEncoder {
    geometry: Geometry,
    encoder: ErasureEncoder,
    next_slice: u16,
}

impl SliceEncoder {
    pub fn new(geometry: Geometry) -> Result<Self, DecodeError> {
        Ok(Self {
            encoder: ErasureEncoder::from_geometry(&geometry)?,
            geometry,
            next_slice: 0,
        })
    }

    /// Bytes of samples one slice carries
    pub fn slice_payload_bytes(&self) -> usize {
        self.geometry.data_blocks() * self.geometry.block_size
    }

    /// Slice index the next call to `encode_slice` will use
    pub fn next_slice(&self) -> u16 {
        self.next_slice
    }

    /// Encode one slice into `original_count + fec_count` datagrams
    ///
    /// `samples` shorter than a full slice is zero padded; longer is an error.
    pub fn encode_slice(
        &mut self,
        meta: &SliceMetadata,
        samples: &[u8],
    ) -> Result<Vec<Bytes>, DecodeError> {
        let block_size = self.geometry.block_size;
        if samples.len() > self.slice_payload_bytes() {
            return Err(DecodeError::BlockSize);
        }

        let mut originals = vec![vec![0u8; block_size]; self.geometry.original_count as usize];
        meta.write(&mut originals[0]);
        for (block, chunk) in originals[1..].iter_mut().zip(samples.chunks(block_size)) {
            block[..chunk.len()].copy_from_slice(chunk);
        }
        let parity = self.encoder.encode(&originals)?;

        let slice_index = self.next_slice;
        self.next_slice = self.next_slice.wrapping_add(1);

        let datagrams = originals
            .iter()
            .chain(parity.iter())
            .enumerate()
            .map(|(index, payload)| {
                let header = BlockHeader {
                    slice_index,
                    block_index: index as u8,
                    original_count: self.geometry.original_count,
                    fec_count: self.geometry.fec_count,
                    sample_bytes: meta.sample_bytes,
                    payload_size: block_size as u16,
                };
                let mut buf = BytesMut::zeroed(HEADER_LEN + block_size);
                header.write(&mut buf);
                buf[HEADER_LEN..].copy_from_slice(payload);
                buf.freeze()
            })
            .collect();
        Ok(datagrams)
    }

    pub fn stats(&self) -> EncoderStats {
        self.encoder.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse, MetaStatus};

    #[test]
    fn test_first_parity_row_is_xor() {
        let mut encoder = ErasureEncoder::new(3, 2, 4).unwrap();
        let originals = [[1u8, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]];
        let parity = encoder.encode(&originals).unwrap();
        assert_eq!(parity[0], vec![1 ^ 5 ^ 9, 2 ^ 6 ^ 10, 3 ^ 7 ^ 11, 4 ^ 8 ^ 12]);
        assert_ne!(parity[1], parity[0]);
        assert_eq!(encoder.stats().slices_encoded, 1);
    }

    #[test]
    fn test_invalid_params() {
        assert!(ErasureEncoder::new(0, 2, 64).is_err());
        assert!(ErasureEncoder::new(200, 57, 64).is_err());
        assert!(ErasureEncoder::new(200, 56, 64).is_ok());

        let mut encoder = ErasureEncoder::new(2, 1, 4).unwrap();
        assert_eq!(
            encoder.encode(&[[0u8; 4]]).unwrap_err(),
            DecodeError::InsufficientBlocks { have: 1, need: 2 }
        );
        assert_eq!(
            encoder.encode(&[vec![0u8; 4], vec![0u8; 3]]).unwrap_err(),
            DecodeError::BlockSize
        );
    }

    #[test]
    fn test_slice_datagrams() {
        let geometry = Geometry::new(4, 2, 64, 8);
        let mut encoder = SliceEncoder::new(geometry).unwrap();
        let meta = SliceMetadata {
            center_frequency: 100_000_000,
            sample_rate: 48_000,
            sample_bytes: 2,
            sample_bits: 16,
            original_count: 4,
            fec_count: 2,
            timestamp_us: 42,
        };
        let samples: Vec<u8> = (0..encoder.slice_payload_bytes()).map(|i| i as u8).collect();

        let datagrams = encoder.encode_slice(&meta, &samples).unwrap();
        assert_eq!(datagrams.len(), 6);
        assert_eq!(encoder.next_slice(), 1);

        let first = parse(&datagrams[0], &geometry).unwrap();
        assert_eq!(first.meta, MetaStatus::Valid(meta));
        let second = parse(&datagrams[1], &geometry).unwrap();
        assert_eq!(second.payload, &samples[..64]);
        let parity = parse(&datagrams[5], &geometry).unwrap();
        assert_eq!(parity.block_index, 5);
        assert!(!parity.is_original(&geometry));
    }

    #[test]
    fn test_slice_index_wraps() {
        let geometry = Geometry::new(2, 1, 32, 4);
        let mut encoder = SliceEncoder::new(geometry).unwrap();
        encoder.next_slice = u16::MAX;
        let meta = SliceMetadata {
            center_frequency: 0,
            sample_rate: 8_000,
            sample_bytes: 2,
            sample_bits: 16,
            original_count: 2,
            fec_count: 1,
            timestamp_us: 0,
        };
        encoder.encode_slice(&meta, &[]).unwrap();
        assert_eq!(encoder.next_slice(), 0);
    }
}
