//! Wire format for FEC-protected sample blocks
//!
//! Every datagram carries exactly one block of one slice:
//!
//! ```text
//! 0      2      3      4      5      6        8
//! ├──────┼──────┼──────┼──────┼──────┼────────┼───────────────────┤
//! │slice │block │orig  │fec   │width │payload │ payload ...       │
//! │u16   │u8    │u8    │u8    │u8    │size u16│                   │
//! ```
//!
//! Block 0 starts its payload with the slice metadata, protected by a CRC-32.
//! All integers are little endian. Parsing is pure and allocation free.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Geometry;
use crate::error::WireError;

/// Block header length in bytes
pub const HEADER_LEN: usize = 8;

/// Metadata length at the start of block 0 payload, CRC included
pub const META_LEN: usize = 28;

/// Bytes covered by the metadata CRC
const META_CRC_OFFSET: usize = META_LEN - 4;

/// Fixed per-datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub slice_index: u16,
    pub block_index: u8,
    pub original_count: u8,
    pub fec_count: u8,
    pub sample_bytes: u8,
    pub payload_size: u16,
}

impl BlockHeader {
    pub fn read(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShort(bytes.len()));
        }
        Ok(Self {
            slice_index: u16::from_le_bytes([bytes[0], bytes[1]]),
            block_index: bytes[2],
            original_count: bytes[3],
            fec_count: bytes[4],
            sample_bytes: bytes[5],
            payload_size: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.slice_index.to_le_bytes());
        out[2] = self.block_index;
        out[3] = self.original_count;
        out[4] = self.fec_count;
        out[5] = self.sample_bytes;
        out[6..8].copy_from_slice(&self.payload_size.to_le_bytes());
    }
}

/// Per-slice stream description carried in block 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SliceMetadata {
    /// Center frequency in Hz
    pub center_frequency: u64,
    /// Nominal sample rate in Hz
    pub sample_rate: u32,
    /// Bytes per I or Q component (2 or 4)
    pub sample_bytes: u8,
    /// Effective bits per component
    pub sample_bits: u8,
    pub original_count: u8,
    pub fec_count: u8,
    /// Sender timestamp in microseconds since the Unix epoch
    pub timestamp_us: u64,
}

impl SliceMetadata {
    /// Serialize into the first `META_LEN` bytes of `out`, CRC included
    pub fn write(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.center_frequency.to_le_bytes());
        out[8..12].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[12] = self.sample_bytes;
        out[13] = self.sample_bits;
        out[14] = self.original_count;
        out[15] = self.fec_count;
        out[16..24].copy_from_slice(&self.timestamp_us.to_le_bytes());
        let crc = crc32fast::hash(&out[..META_CRC_OFFSET]);
        out[META_CRC_OFFSET..META_LEN].copy_from_slice(&crc.to_le_bytes());
    }

    /// Parse and verify the metadata prefix of a block 0 payload
    pub fn read(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < META_LEN {
            return Err(WireError::TooShort(bytes.len()));
        }
        let expected = u32::from_le_bytes([
            bytes[META_CRC_OFFSET],
            bytes[META_CRC_OFFSET + 1],
            bytes[META_CRC_OFFSET + 2],
            bytes[META_CRC_OFFSET + 3],
        ]);
        if crc32fast::hash(&bytes[..META_CRC_OFFSET]) != expected {
            return Err(WireError::MetaChecksum);
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let meta = Self {
            center_frequency: u64_at(0),
            sample_rate: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            sample_bytes: bytes[12],
            sample_bits: bytes[13],
            original_count: bytes[14],
            fec_count: bytes[15],
            timestamp_us: u64_at(16),
        };
        if !matches!(meta.sample_bytes, 2 | 4) {
            return Err(WireError::SampleBytes(meta.sample_bytes));
        }
        Ok(meta)
    }

    /// Sender timestamp as wall-clock time
    pub fn stream_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.timestamp_us as i64)
    }
}

/// Outcome of metadata validation on a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStatus {
    /// Not block 0
    Absent,
    Valid(SliceMetadata),
    /// Block 0 whose metadata failed validation; payload is still a valid symbol
    Corrupt,
}

/// A validated block borrowed from its datagram
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    pub slice_index: u16,
    pub block_index: u8,
    pub sample_bytes: u8,
    pub meta: MetaStatus,
    pub payload: &'a [u8],
}

impl Block<'_> {
    pub fn is_meta_block(&self) -> bool {
        self.block_index == 0
    }

    pub fn is_original(&self, geometry: &Geometry) -> bool {
        self.block_index < geometry.original_count
    }
}

/// Parse and validate one datagram against the session geometry
pub fn parse<'a>(datagram: &'a [u8], geometry: &Geometry) -> Result<Block<'a>, WireError> {
    let header = BlockHeader::read(datagram)?;

    let declared = header.payload_size as usize;
    if declared != geometry.block_size {
        return Err(WireError::PayloadSize {
            declared,
            expected: geometry.block_size,
        });
    }
    let expected_len = HEADER_LEN + declared;
    if datagram.len() != expected_len {
        return Err(WireError::Length {
            actual: datagram.len(),
            expected: expected_len,
        });
    }
    if header.original_count != geometry.original_count || header.fec_count != geometry.fec_count {
        return Err(WireError::Geometry {
            original_count: header.original_count,
            fec_count: header.fec_count,
        });
    }
    if header.block_index as usize >= geometry.total_blocks() {
        return Err(WireError::BlockIndex {
            index: header.block_index,
            total: geometry.total_blocks(),
        });
    }
    if !matches!(header.sample_bytes, 2 | 4) {
        return Err(WireError::SampleBytes(header.sample_bytes));
    }

    let payload = &datagram[HEADER_LEN..];
    let meta = if header.block_index == 0 {
        match SliceMetadata::read(payload) {
            Ok(meta) => MetaStatus::Valid(meta),
            Err(_) => MetaStatus::Corrupt,
        }
    } else {
        MetaStatus::Absent
    };

    Ok(Block {
        slice_index: header.slice_index,
        block_index: header.block_index,
        sample_bytes: header.sample_bytes,
        meta,
        payload,
    })
}
