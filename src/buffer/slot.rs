//! One ring position of the slice assembler

use crate::config::Geometry;
use crate::protocol::SliceMetadata;

/// Lifecycle of a slot
///
/// `Empty → Filling → {Complete | Recovered | Expired}`; a slot only goes
/// back to `Empty` when the assembler retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Filling,
    /// Every original block arrived
    Complete,
    /// Missing originals rebuilt from parity
    Recovered,
    /// Deadline passed or decoding failed
    Expired,
}

impl SlotState {
    /// Samples can be delivered as-is
    pub fn is_ready(self) -> bool {
        matches!(self, SlotState::Complete | SlotState::Recovered)
    }

    /// No further blocks change the slot
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            SlotState::Complete | SlotState::Recovered | SlotState::Expired
        )
    }
}

/// 256-bit block presence mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMask([u64; 4]);

impl BlockMask {
    /// Set bit `index`; returns false when it was already set
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        let fresh = self.0[word] & bit == 0;
        self.0[word] |= bit;
        fresh
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.0[index / 64] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.0 = [0; 4];
    }
}

/// Storage and bookkeeping for one slice
pub struct SliceSlot {
    pub(crate) seq: u64,
    pub(crate) state: SlotState,
    pub(crate) originals: BlockMask,
    pub(crate) parity: BlockMask,
    /// `original_count` blocks, block 0 first
    pub(crate) data: Vec<u8>,
    /// `fec_count` parity blocks
    pub(crate) fec: Vec<u8>,
    pub(crate) meta: Option<SliceMetadata>,
    /// Block 0 arrived or was rebuilt but its metadata did not validate
    pub(crate) meta_corrupt: bool,
    pub(crate) sample_bytes: u8,
    pub(crate) first_tick: u64,
    pub(crate) deadline: u64,
    /// Original blocks rebuilt by the decoder
    pub(crate) recovered: usize,
    /// Blocks that arrived after the slot was resolved
    pub(crate) redundant: usize,
    block_size: usize,
}

impl SliceSlot {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            seq: 0,
            state: SlotState::Empty,
            originals: BlockMask::default(),
            parity: BlockMask::default(),
            data: vec![0u8; geometry.original_count as usize * geometry.block_size],
            fec: vec![0u8; geometry.fec_count as usize * geometry.block_size],
            meta: None,
            meta_corrupt: false,
            sample_bytes: 0,
            first_tick: 0,
            deadline: 0,
            recovered: 0,
            redundant: 0,
            block_size: geometry.block_size,
        }
    }

    /// Repurpose the slot for `seq`, first seen at `now_tick`
    pub(crate) fn open(&mut self, seq: u64, now_tick: u64, timeout_ticks: u64) {
        self.seq = seq;
        self.state = SlotState::Filling;
        self.originals.clear();
        self.parity.clear();
        self.data.fill(0);
        self.meta = None;
        self.meta_corrupt = false;
        self.sample_bytes = 0;
        self.first_tick = now_tick;
        self.deadline = now_tick + timeout_ticks;
        self.recovered = 0;
        self.redundant = 0;
    }

    pub(crate) fn clear(&mut self) {
        self.state = SlotState::Empty;
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn meta(&self) -> Option<&SliceMetadata> {
        self.meta.as_ref()
    }

    pub fn meta_corrupt(&self) -> bool {
        self.meta_corrupt
    }

    /// Sample width announced by the block headers
    pub fn sample_bytes(&self) -> u8 {
        self.sample_bytes
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    pub fn is_overdue(&self, now_tick: u64) -> bool {
        now_tick >= self.deadline
    }

    pub fn received_originals(&self) -> usize {
        self.originals.count()
    }

    pub fn received_count(&self) -> usize {
        self.originals.count() + self.parity.count()
    }

    pub fn recovered_blocks(&self) -> usize {
        self.recovered
    }

    /// Payload of original block `index`
    pub fn block(&self, index: usize) -> &[u8] {
        &self.data[index * self.block_size..(index + 1) * self.block_size]
    }

    pub(crate) fn block_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.data[index * self.block_size..(index + 1) * self.block_size]
    }

    pub(crate) fn parity_block_mut(&mut self, row: usize) -> &mut [u8] {
        &mut self.fec[row * self.block_size..(row + 1) * self.block_size]
    }

    /// Sample bytes carried by blocks `1..original_count`
    ///
    /// Missing originals read as zeros.
    pub fn sample_data(&self) -> &[u8] {
        &self.data[self.block_size..]
    }

    /// Received blocks as `(index, payload)` for the decoder
    pub(crate) fn received_blocks(&self, original_count: usize) -> Vec<(u8, &[u8])> {
        let originals = (0..original_count)
            .filter(|&j| self.originals.contains(j))
            .map(move |j| (j as u8, self.block(j)));
        let parity = (0..self.fec.len() / self.block_size)
            .filter(|&r| self.parity.contains(r))
            .map(move |r| {
                (
                    (original_count + r) as u8,
                    &self.fec[r * self.block_size..(r + 1) * self.block_size],
                )
            });
        originals.chain(parity).collect()
    }
}
