//! Sample chunks and width conversion

use serde::Serialize;

/// How a chunk's samples were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrigin {
    /// Every original block arrived
    Intact,
    /// Missing blocks rebuilt from parity
    Recovered,
    /// Substitute for a lost slice (zeros or a repeat)
    Concealed,
}

/// One slice worth of I/Q samples handed to the sink
#[derive(Debug, Clone)]
pub struct SampleChunk {
    /// Interleaved I, Q at `sample_bits` resolution
    pub samples: Vec<i32>,
    pub sample_bits: u8,
    pub sample_rate: u32,
    /// Center frequency in Hz
    pub center_frequency: u64,
    /// Sender timestamp in microseconds
    pub timestamp_us: u64,
    /// Slice sequence number
    pub sequence: u64,
    pub origin: ChunkOrigin,
}

impl SampleChunk {
    /// Number of complex samples
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Chunk duration in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1_000_000 / self.sample_rate as u64
    }

    pub fn is_concealed(&self) -> bool {
        self.origin == ChunkOrigin::Concealed
    }
}

/// Effective bits for a remote sample width
///
/// 2-byte samples carry 16 bits, 4-byte samples carry 24 bits unless the
/// metadata says fewer.
pub fn remote_bits(sample_bytes: u8, declared_bits: u8) -> u8 {
    let max = if sample_bytes == 2 { 16 } else { 24 };
    if declared_bits == 0 || declared_bits > max {
        max
    } else {
        declared_bits
    }
}

/// Convert little-endian remote I/Q components to `local_bits` resolution
///
/// `sample_bytes` is 2 (i16) or 4 (24 bits in an i32). Samples are shifted
/// up or down to the local width.
pub fn convert(raw: &[u8], sample_bytes: u8, remote_bits: u8, local_bits: u8, out: &mut Vec<i32>) {
    let shift = local_bits as i32 - remote_bits as i32;
    let scale = |v: i32| {
        if shift >= 0 {
            v << shift
        } else {
            v >> -shift
        }
    };

    out.clear();
    match sample_bytes {
        2 => out.extend(
            raw.chunks_exact(2)
                .map(|b| scale(i16::from_le_bytes([b[0], b[1]]) as i32)),
        ),
        _ => out.extend(
            raw.chunks_exact(4)
                .map(|b| scale(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_16_to_16() {
        let raw: Vec<u8> = [1i16, -2, i16::MAX, i16::MIN]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = Vec::new();
        convert(&raw, 2, 16, 16, &mut out);
        assert_eq!(out, vec![1, -2, i16::MAX as i32, i16::MIN as i32]);
    }

    #[test]
    fn test_convert_16_to_24() {
        let raw: Vec<u8> = [1i16, -1].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = Vec::new();
        convert(&raw, 2, 16, 24, &mut out);
        assert_eq!(out, vec![256, -256]);
    }

    #[test]
    fn test_convert_24_to_16() {
        let raw: Vec<u8> = [0x7f_ffffi32, -0x80_0000, 0x100]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = Vec::new();
        convert(&raw, 4, 24, 16, &mut out);
        assert_eq!(out, vec![0x7fff, -0x8000, 1]);
    }

    #[test]
    fn test_remote_bits() {
        assert_eq!(remote_bits(2, 0), 16);
        assert_eq!(remote_bits(2, 12), 12);
        assert_eq!(remote_bits(4, 32), 24);
        assert_eq!(remote_bits(4, 24), 24);
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = SampleChunk {
            samples: vec![0; 96],
            sample_bits: 16,
            sample_rate: 48_000,
            center_frequency: 0,
            timestamp_us: 0,
            sequence: 0,
            origin: ChunkOrigin::Intact,
        };
        assert_eq!(chunk.frames(), 48);
        assert_eq!(chunk.duration_us(), 1_000);
    }
}
