//! Erasure decoder
//!
//! Recovers missing original blocks of a slice from any `original_count`
//! received blocks. Block selection is deterministic: every present
//! original, then parity blocks in ascending index order.

use super::gf::{self, cauchy_element};
use crate::config::Geometry;
use crate::constants::MAX_TOTAL_BLOCKS;
use crate::error::DecodeError;

/// Cauchy Reed-Solomon erasure decoder
pub struct ErasureDecoder {
    original_count: u8,
    fec_count: u8,
    block_size: usize,
    /// Slices that needed (and got) recovery
    slices_recovered: u64,
    /// Original blocks rebuilt
    blocks_recovered: u64,
    /// Decode attempts that failed
    failures: u64,
}

impl ErasureDecoder {
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
            slices_recovered: 0,
            blocks_recovered: 0,
            failures: 0,
        })
    }

    pub fn from_geometry(geometry: &Geometry) -> Result<Self, DecodeError> {
        Self::new(geometry.original_count, geometry.fec_count, geometry.block_size)
    }

    /// Recover the missing originals from the received `(index, payload)` blocks
    ///
    /// Returns the rebuilt originals in ascending index order. An empty result
    /// means nothing was missing.
    pub fn decode(&mut self, blocks: &[(u8, &[u8])]) -> Result<Vec<(u8, Vec<u8>)>, DecodeError> {
        match self.solve(blocks) {
            Ok(recovered) => {
                if !recovered.is_empty() {
                    self.slices_recovered += 1;
                    self.blocks_recovered += recovered.len() as u64;
                }
                Ok(recovered)
            }
            Err(e) => {
                self.failures += 1;
                Err(e)
            }
        }
    }

    fn solve(&self, blocks: &[(u8, &[u8])]) -> Result<Vec<(u8, Vec<u8>)>, DecodeError> {
        let k = self.original_count as usize;
        let total = k + self.fec_count as usize;

        let mut originals: Vec<Option<&[u8]>> = vec![None; k];
        let mut parity: Vec<Option<&[u8]>> = vec![None; self.fec_count as usize];
        for &(index, payload) in blocks {
            let index = index as usize;
            if index >= total {
                return Err(DecodeError::InvalidParams);
            }
            if payload.len() != self.block_size {
                return Err(DecodeError::BlockSize);
            }
            let slot = if index < k {
                &mut originals[index]
            } else {
                &mut parity[index - k]
            };
            if slot.replace(payload).is_some() {
                return Err(DecodeError::DuplicateIndex(index as u8));
            }
        }

        let missing: Vec<usize> = (0..k).filter(|&j| originals[j].is_none()).collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<usize> = (0..parity.len())
            .filter(|&r| parity[r].is_some())
            .take(missing.len())
            .collect();
        if rows.len() < missing.len() {
            return Err(DecodeError::InsufficientBlocks {
                have: k - missing.len() + rows.len(),
                need: k,
            });
        }

        let x_0 = self.original_count;

        // Strip the known originals from each chosen parity block
        let mut residuals: Vec<Vec<u8>> = Vec::with_capacity(rows.len());
        for &r in &rows {
            let x_i = x_0 + r as u8;
            let mut residual = parity[r].map(<[u8]>::to_vec).unwrap_or_default();
            for (j, original) in originals.iter().enumerate() {
                if let Some(original) = original {
                    gf::mul_add_into(&mut residual, original, cauchy_element(x_i, x_0, j as u8));
                }
            }
            residuals.push(residual);
        }

        let n = missing.len();
        let mut matrix = Vec::with_capacity(n * n);
        for &r in &rows {
            let x_i = x_0 + r as u8;
            matrix.extend(missing.iter().map(|&j| cauchy_element(x_i, x_0, j as u8)));
        }
        let inverse = gf::invert(&matrix, n).ok_or(DecodeError::SingularMatrix)?;

        let recovered = missing
            .iter()
            .enumerate()
            .map(|(b, &j)| {
                let mut block = vec![0u8; self.block_size];
                for (a, residual) in residuals.iter().enumerate() {
                    gf::mul_add_into(&mut block, residual, inverse[b * n + a]);
                }
                (j as u8, block)
            })
            .collect();
        Ok(recovered)
    }

    pub fn original_count(&self) -> u8 {
        self.original_count
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get decoder statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            slices_recovered: self.slices_recovered,
            blocks_recovered: self.blocks_recovered,
            failures: self.failures,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub slices_recovered: u64,
    pub blocks_recovered: u64,
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ErasureEncoder;
    use proptest::prelude::*;

    fn make_slice(k: u8, m: u8, size: usize, seed: u8) -> Vec<Vec<u8>> {
        let mut encoder = ErasureEncoder::new(k, m, size).unwrap();
        let originals: Vec<Vec<u8>> = (0..k as usize)
            .map(|j| {
                (0..size)
                    .map(|i| (i as u8).wrapping_mul(31).wrapping_add(j as u8 ^ seed))
                    .collect()
            })
            .collect();
        let parity = encoder.encode(&originals).unwrap();
        originals.into_iter().chain(parity).collect()
    }

    fn decode_subset(
        decoder: &mut ErasureDecoder,
        blocks: &[Vec<u8>],
        keep: &[usize],
    ) -> Result<Vec<Vec<u8>>, DecodeError> {
        let k = decoder.original_count() as usize;
        let received: Vec<(u8, &[u8])> = keep
            .iter()
            .map(|&i| (i as u8, blocks[i].as_slice()))
            .collect();
        let recovered = decoder.decode(&received)?;

        let mut originals: Vec<Option<Vec<u8>>> = vec![None; k];
        for &i in keep.iter().filter(|&&i| i < k) {
            originals[i] = Some(blocks[i].clone());
        }
        for (index, block) in recovered {
            originals[index as usize] = Some(block);
        }
        Ok(originals.into_iter().map(|b| b.unwrap()).collect())
    }

    #[test]
    fn test_nothing_missing() {
        let blocks = make_slice(4, 2, 16, 1);
        let mut decoder = ErasureDecoder::new(4, 2, 16).unwrap();
        let received: Vec<(u8, &[u8])> = (0..4).map(|i| (i as u8, blocks[i].as_slice())).collect();
        assert!(decoder.decode(&received).unwrap().is_empty());
        assert_eq!(decoder.stats().slices_recovered, 0);
    }

    #[test]
    fn test_any_two_drops_recover() {
        let blocks = make_slice(4, 2, 32, 7);
        let mut decoder = ErasureDecoder::new(4, 2, 32).unwrap();
        for a in 0..6 {
            for b in (a + 1)..6 {
                let keep: Vec<usize> = (0..6).filter(|&i| i != a && i != b).collect();
                let decoded = decode_subset(&mut decoder, &blocks, &keep).unwrap();
                assert_eq!(decoded, blocks[..4].to_vec(), "dropped {} and {}", a, b);
            }
        }
    }

    #[test]
    fn test_three_drops_insufficient() {
        let blocks = make_slice(4, 2, 32, 3);
        let mut decoder = ErasureDecoder::new(4, 2, 32).unwrap();
        let err = decode_subset(&mut decoder, &blocks, &[0, 4, 5]).unwrap_err();
        assert_eq!(err, DecodeError::InsufficientBlocks { have: 3, need: 4 });
        assert_eq!(decoder.stats().failures, 1);
    }

    #[test]
    fn test_duplicate_index() {
        let blocks = make_slice(3, 1, 8, 0);
        let mut decoder = ErasureDecoder::new(3, 1, 8).unwrap();
        let received = [
            (0u8, blocks[0].as_slice()),
            (0u8, blocks[0].as_slice()),
            (3u8, blocks[3].as_slice()),
        ];
        assert_eq!(decoder.decode(&received).unwrap_err(), DecodeError::DuplicateIndex(0));
    }

    #[test]
    fn test_block_size_mismatch() {
        let mut decoder = ErasureDecoder::new(2, 1, 8).unwrap();
        let short = [0u8; 4];
        assert_eq!(decoder.decode(&[(0, &short[..])]).unwrap_err(), DecodeError::BlockSize);
    }

    #[test]
    fn test_extra_parity_is_ignored() {
        let blocks = make_slice(5, 3, 24, 9);
        let mut decoder = ErasureDecoder::new(5, 3, 24).unwrap();
        let decoded = decode_subset(&mut decoder, &blocks, &[0, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(decoded, blocks[..5].to_vec());
        assert_eq!(decoder.stats().blocks_recovered, 1);
    }

    proptest! {
        #[test]
        fn prop_any_subset_recovers(
            (k, m, keep) in (2u8..12, 1u8..6).prop_flat_map(|(k, m)| {
                let all: Vec<usize> = (0..(k + m) as usize).collect();
                (Just(k), Just(m), proptest::sample::subsequence(all, k as usize).prop_shuffle())
            }),
            seed in any::<u8>(),
        ) {
            let blocks = make_slice(k, m, 16, seed);
            let mut decoder = ErasureDecoder::new(k, m, 16).unwrap();
            let decoded = decode_subset(&mut decoder, &blocks, &keep).unwrap();
            prop_assert_eq!(decoded, blocks[..k as usize].to_vec());
        }
    }
}
