//! Slice assembler
//!
//! Collects blocks into a ring of slots indexed by `seq mod ring_depth`.
//! The 16-bit slice index on the wire is unwrapped to a 64-bit sequence
//! relative to the newest slice seen, so ordering survives wrap-around.

use tracing::{debug, info, trace};

use super::slot::{SliceSlot, SlotState};
use crate::codec::ErasureDecoder;
use crate::config::Geometry;
use crate::constants::SLICE_INDEX_MODULUS;
use crate::error::DecodeError;
use crate::protocol::{Block, MetaStatus, SliceMetadata};

/// Result of ingesting one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// The block completed the set of originals
    BecameComplete,
    /// Enough blocks to decode; the caller should run recovery
    BecameRecoverable,
    StillFilling,
    DuplicateIgnored,
    /// Slice already behind the playout cursor
    Late,
    /// Slice already resolved
    Redundant,
}

/// Why a slice left the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Handed to playout (or substituted)
    Played,
    /// Dropped to make room while ready
    Skipped,
    /// Dropped to make room before it could be resolved
    Overrun,
    /// Ready but unplayable: no stream metadata to describe it
    Discarded,
}

/// Summary of a retired slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredSlice {
    pub seq: u64,
    /// State the slot was in, `Empty` if nothing ever arrived
    pub state: SlotState,
    pub reason: RetireReason,
    pub blocks_received: usize,
    pub originals_received: usize,
    pub blocks_recovered: usize,
}

impl RetiredSlice {
    /// The slice ended without its samples
    pub fn is_unrecoverable(&self) -> bool {
        !self.state.is_ready() || self.reason == RetireReason::Discarded
    }
}

/// Ring of slice slots owned by the session worker
pub struct SliceAssembler {
    geometry: Geometry,
    slots: Vec<SliceSlot>,
    /// Mask for fast modulo
    mask: u64,
    timeout_ticks: u64,
    /// Newest sequence seen
    newest: Option<u64>,
    /// Oldest sequence still owned by the ring
    cursor: u64,
    /// Slices retired by ring overrun, drained by the session
    overrun: Vec<RetiredSlice>,
    discontinuities: u64,
}

impl SliceAssembler {
    /// Create an assembler; `geometry` must already be validated
    pub fn new(geometry: Geometry, timeout_ticks: u64) -> Self {
        let slots = (0..geometry.ring_depth)
            .map(|_| SliceSlot::new(&geometry))
            .collect();
        Self {
            geometry,
            slots,
            mask: geometry.ring_depth as u64 - 1,
            timeout_ticks,
            newest: None,
            cursor: 0,
            overrun: Vec::new(),
            discontinuities: 0,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Map a wire slice index to a sequence number
    ///
    /// The first slice seen starts one modulus in so that slightly older
    /// indices still map to a positive sequence.
    pub fn sequence_of(&self, slice_index: u16) -> u64 {
        match self.newest {
            None => SLICE_INDEX_MODULUS + slice_index as u64,
            Some(newest) => {
                let delta = slice_index.wrapping_sub(newest as u16) as i16;
                newest.wrapping_add_signed(delta as i64)
            }
        }
    }

    /// Insert a validated block
    pub fn ingest(&mut self, block: &Block<'_>, now_tick: u64) -> SlotEvent {
        let seq = self.sequence_of(block.slice_index);

        let newest = self.newest;
        match newest {
            None => {
                self.newest = Some(seq);
                self.cursor = seq;
            }
            Some(newest) if seq.abs_diff(newest) > self.geometry.ring_depth as u64 => {
                self.resync(seq, newest);
            }
            Some(_) if seq < self.cursor => {
                trace!(seq, cursor = self.cursor, "late block");
                return SlotEvent::Late;
            }
            Some(newest) if seq > newest => {
                self.newest = Some(seq);
                self.enforce_depth();
            }
            Some(_) => {}
        }

        let index = (seq & self.mask) as usize;
        if self.slots[index].state != SlotState::Empty && self.slots[index].seq != seq {
            // Stale occupant of the slot
            let retired = self.retire_slot(index, RetireReason::Overrun);
            self.overrun.push(retired);
        }

        let k = self.geometry.original_count as usize;
        let timeout_ticks = self.timeout_ticks;
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Empty {
            slot.open(seq, now_tick, timeout_ticks);
        }
        if slot.state.is_resolved() {
            slot.redundant += 1;
            return SlotEvent::Redundant;
        }

        let block_index = block.block_index as usize;
        if block_index < k {
            if !slot.originals.insert(block_index) {
                return SlotEvent::DuplicateIgnored;
            }
            slot.block_mut(block_index).copy_from_slice(block.payload);
        } else {
            if !slot.parity.insert(block_index - k) {
                return SlotEvent::DuplicateIgnored;
            }
            slot.parity_block_mut(block_index - k).copy_from_slice(block.payload);
        }

        if slot.sample_bytes == 0 {
            slot.sample_bytes = block.sample_bytes;
        }
        match block.meta {
            MetaStatus::Valid(meta) => slot.meta = Some(meta),
            MetaStatus::Corrupt => slot.meta_corrupt = true,
            MetaStatus::Absent => {}
        }

        if slot.originals.count() == k {
            slot.state = SlotState::Complete;
            SlotEvent::BecameComplete
        } else if slot.received_count() >= k {
            SlotEvent::BecameRecoverable
        } else {
            SlotEvent::StillFilling
        }
    }

    /// Rebuild the missing originals of `seq`
    ///
    /// On success the slot becomes `Recovered` and the number of rebuilt
    /// blocks is returned. On failure the slot becomes `Expired`.
    pub fn recover(&mut self, seq: u64, decoder: &mut ErasureDecoder) -> Result<usize, DecodeError> {
        let k = self.geometry.original_count as usize;
        let index = (seq & self.mask) as usize;
        let slot = &mut self.slots[index];
        if slot.seq != seq || slot.state != SlotState::Filling {
            return Err(DecodeError::InvalidParams);
        }

        let result = decoder.decode(&slot.received_blocks(k));
        match result {
            Ok(rebuilt) => {
                let count = rebuilt.len();
                for (block_index, payload) in rebuilt {
                    let block_index = block_index as usize;
                    slot.block_mut(block_index).copy_from_slice(&payload);
                    if block_index == 0 {
                        match SliceMetadata::read(&payload) {
                            Ok(meta) => slot.meta = Some(meta),
                            Err(_) => slot.meta_corrupt = true,
                        }
                    }
                }
                slot.recovered = count;
                slot.state = SlotState::Recovered;
                debug!(seq, recovered = count, "slice recovered");
                Ok(count)
            }
            Err(e) => {
                slot.state = SlotState::Expired;
                Err(e)
            }
        }
    }

    /// Expire every filling slot whose deadline has passed
    pub fn expire_overdue(&mut self, now_tick: u64) -> usize {
        let mut expired = 0;
        for slot in &mut self.slots {
            if slot.state == SlotState::Filling && slot.is_overdue(now_tick) {
                slot.state = SlotState::Expired;
                expired += 1;
                debug!(
                    seq = slot.seq,
                    received = slot.received_count(),
                    "slice expired"
                );
            }
        }
        expired
    }

    /// Slot at the playout cursor, `None` when nothing arrived for it yet
    pub fn front(&self) -> Option<&SliceSlot> {
        self.newest?;
        let slot = &self.slots[(self.cursor & self.mask) as usize];
        (slot.state != SlotState::Empty && slot.seq == self.cursor).then_some(slot)
    }

    /// Retire the slice at the cursor and move the cursor forward
    pub fn advance(&mut self, reason: RetireReason) -> Option<RetiredSlice> {
        self.newest?;
        let index = (self.cursor & self.mask) as usize;
        let retired = if self.slots[index].seq == self.cursor {
            self.retire_slot(index, reason)
        } else {
            RetiredSlice {
                seq: self.cursor,
                state: SlotState::Empty,
                reason,
                blocks_received: 0,
                originals_received: 0,
                blocks_recovered: 0,
            }
        };
        self.cursor += 1;
        Some(retired)
    }

    fn retire_slot(&mut self, index: usize, reason: RetireReason) -> RetiredSlice {
        let slot = &mut self.slots[index];
        let retired = RetiredSlice {
            seq: slot.seq,
            state: slot.state,
            reason,
            blocks_received: slot.received_count() + slot.redundant,
            originals_received: slot.received_originals(),
            blocks_recovered: slot.recovered,
        };
        slot.clear();
        retired
    }

    /// Keep `newest - cursor` below the ring depth
    fn enforce_depth(&mut self) {
        let Some(newest) = self.newest else { return };
        let depth = self.geometry.ring_depth as u64;
        while newest - self.cursor >= depth {
            let index = (self.cursor & self.mask) as usize;
            let slot = &self.slots[index];
            let reason = if slot.seq == self.cursor && slot.state.is_ready() {
                RetireReason::Skipped
            } else {
                RetireReason::Overrun
            };
            if let Some(retired) = self.advance(reason) {
                debug!(seq = retired.seq, ?reason, "slice pushed out of ring");
                self.overrun.push(retired);
            }
        }
    }

    /// Restart the sequence origin at `seq` after an index discontinuity
    ///
    /// Occupied slots are retired in order; the slices between the old and
    /// the new origin are never counted.
    fn resync(&mut self, seq: u64, newest: u64) {
        let mut occupied: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].state != SlotState::Empty)
            .collect();
        occupied.sort_by_key(|&i| self.slots[i].seq);

        let flushed = occupied.len();
        let mut retired = std::mem::take(&mut self.overrun);
        for index in occupied {
            let reason = if self.slots[index].state.is_ready() {
                RetireReason::Skipped
            } else {
                RetireReason::Overrun
            };
            retired.push(self.retire_slot(index, reason));
        }

        info!(
            old = newest,
            new = seq,
            flushed,
            "slice index discontinuity, resynchronising"
        );
        self.reset();
        self.overrun = retired;
        self.newest = Some(seq);
        self.cursor = seq;
        self.discontinuities += 1;
    }

    /// Number of resynchronisations since creation
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Slices retired by the ring itself since the last call
    pub fn take_overrun(&mut self) -> Vec<RetiredSlice> {
        std::mem::take(&mut self.overrun)
    }

    pub fn cursor(&self) -> Option<u64> {
        self.newest.map(|_| self.cursor)
    }

    pub fn newest(&self) -> Option<u64> {
        self.newest
    }

    /// `newest - cursor`, zero before the first block
    pub fn gauge(&self) -> i64 {
        match self.newest {
            Some(newest) => newest as i64 - self.cursor as i64,
            None => 0,
        }
    }

    /// Slices between the cursor and the newest, inclusive
    pub fn buffered(&self) -> usize {
        (self.gauge() + 1).max(0) as usize
    }

    /// Drop every slot and forget the sequence origin
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.newest = None;
        self.cursor = 0;
        self.overrun.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SliceEncoder;
    use crate::protocol::parse;

    fn geometry() -> Geometry {
        Geometry::new(4, 2, 64, 8)
    }

    fn meta() -> SliceMetadata {
        SliceMetadata {
            center_frequency: 7_100_000,
            sample_rate: 48_000,
            sample_bytes: 2,
            sample_bits: 16,
            original_count: 4,
            fec_count: 2,
            timestamp_us: 1,
        }
    }

    fn slices(count: usize) -> Vec<Vec<bytes::Bytes>> {
        let mut encoder = SliceEncoder::new(geometry()).unwrap();
        (0..count)
            .map(|n| {
                let samples: Vec<u8> = (0..encoder.slice_payload_bytes())
                    .map(|i| (i + n * 3) as u8)
                    .collect();
                encoder.encode_slice(&meta(), &samples).unwrap()
            })
            .collect()
    }

    fn ingest(asm: &mut SliceAssembler, datagram: &[u8], tick: u64) -> SlotEvent {
        let block = parse(datagram, &geometry()).unwrap();
        asm.ingest(&block, tick)
    }

    #[test]
    fn test_complete_in_order() {
        let slices = slices(1);
        let mut asm = SliceAssembler::new(geometry(), 8);

        assert_eq!(ingest(&mut asm, &slices[0][0], 0), SlotEvent::StillFilling);
        assert_eq!(ingest(&mut asm, &slices[0][1], 0), SlotEvent::StillFilling);
        assert_eq!(ingest(&mut asm, &slices[0][2], 0), SlotEvent::StillFilling);
        assert_eq!(ingest(&mut asm, &slices[0][3], 0), SlotEvent::BecameComplete);
        assert_eq!(ingest(&mut asm, &slices[0][4], 0), SlotEvent::Redundant);

        let front = asm.front().unwrap();
        assert_eq!(front.state(), SlotState::Complete);
        assert_eq!(front.meta(), Some(&meta()));
    }

    #[test]
    fn test_duplicate_is_noop() {
        let slices = slices(1);
        let mut asm = SliceAssembler::new(geometry(), 8);
        ingest(&mut asm, &slices[0][1], 0);
        assert_eq!(ingest(&mut asm, &slices[0][1], 0), SlotEvent::DuplicateIgnored);
        assert_eq!(asm.front().unwrap().received_count(), 1);
        assert_eq!(asm.front().unwrap().state(), SlotState::Filling);
    }

    #[test]
    fn test_recover_with_parity() {
        let slices = slices(1);
        let mut asm = SliceAssembler::new(geometry(), 8);
        let mut decoder = ErasureDecoder::from_geometry(&geometry()).unwrap();

        for i in [1, 3, 4] {
            assert_eq!(ingest(&mut asm, &slices[0][i], 0), SlotEvent::StillFilling);
        }
        assert_eq!(ingest(&mut asm, &slices[0][5], 0), SlotEvent::BecameRecoverable);
        let seq = asm.cursor().unwrap();
        assert_eq!(asm.recover(seq, &mut decoder).unwrap(), 2);

        let front = asm.front().unwrap();
        assert_eq!(front.state(), SlotState::Recovered);
        assert_eq!(front.meta(), Some(&meta()));
        assert_eq!(front.block(2), &slices[0][2][crate::protocol::HEADER_LEN..]);
    }

    #[test]
    fn test_reverse_order_matches_forward() {
        let slices = slices(1);
        let mut forward = SliceAssembler::new(geometry(), 8);
        let mut reverse = SliceAssembler::new(geometry(), 8);
        let mut decoder = ErasureDecoder::from_geometry(&geometry()).unwrap();

        for i in [0, 2, 4, 5] {
            ingest(&mut forward, &slices[0][i], 0);
        }
        for i in [5, 4, 2, 0] {
            ingest(&mut reverse, &slices[0][i], 0);
        }
        let seq = forward.cursor().unwrap();
        forward.recover(seq, &mut decoder).unwrap();
        reverse.recover(seq, &mut decoder).unwrap();

        assert_eq!(
            forward.front().unwrap().sample_data(),
            reverse.front().unwrap().sample_data()
        );
    }

    #[test]
    fn test_three_drops_expire() {
        let slices = slices(1);
        let mut asm = SliceAssembler::new(geometry(), 4);
        for i in [0, 4, 5] {
            assert_eq!(ingest(&mut asm, &slices[0][i], 10), SlotEvent::StillFilling);
        }
        assert_eq!(asm.expire_overdue(13), 0);
        assert_eq!(asm.expire_overdue(14), 1);
        assert_eq!(asm.front().unwrap().state(), SlotState::Expired);
        assert_eq!(ingest(&mut asm, &slices[0][1], 15), SlotEvent::Redundant);
    }

    #[test]
    fn test_late_block_after_advance() {
        let slices = slices(2);
        let mut asm = SliceAssembler::new(geometry(), 8);
        ingest(&mut asm, &slices[0][1], 0);
        ingest(&mut asm, &slices[1][1], 0);

        let retired = asm.advance(RetireReason::Played).unwrap();
        assert!(retired.is_unrecoverable());
        assert_eq!(ingest(&mut asm, &slices[0][2], 1), SlotEvent::Late);
    }

    #[test]
    fn test_ring_overrun_retires_oldest() {
        let slices = slices(10);
        let mut asm = SliceAssembler::new(geometry(), 100);

        for i in 0..4 {
            ingest(&mut asm, &slices[0][i], 0);
        }
        ingest(&mut asm, &slices[1][1], 0);
        for slice in &slices[2..10] {
            ingest(&mut asm, &slice[1], 0);
        }

        // Newest is 9 slices past the first; depth 8 keeps only the last 8
        let retired = asm.take_overrun();
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0].reason, RetireReason::Skipped);
        assert_eq!(retired[1].reason, RetireReason::Overrun);
        assert!(retired[1].is_unrecoverable());
        assert_eq!(asm.gauge(), 7);
        assert!(asm.gauge() < geometry().ring_depth as i64);
    }

    #[test]
    fn test_slice_index_wraps() {
        let mut asm = SliceAssembler::new(geometry(), 8);
        let first = asm.sequence_of(65_534);
        asm.newest = Some(first);
        asm.cursor = first;
        assert_eq!(asm.sequence_of(65_535), first + 1);
        assert_eq!(asm.sequence_of(0), first + 2);
        assert_eq!(asm.sequence_of(65_530), first - 4);
    }

    #[test]
    fn test_sender_restart_resynchronises() {
        let before = slices(200);
        let mut asm = SliceAssembler::new(geometry(), 100);
        for slice in &before {
            ingest(&mut asm, &slice[1], 0);
        }
        asm.take_overrun();
        let old_newest = asm.newest().unwrap();

        // A restarted sender begins again at slice index 0
        let after = slices(1);
        assert_eq!(ingest(&mut asm, &after[0][0], 1), SlotEvent::StillFilling);
        assert_eq!(asm.discontinuities(), 1);

        let flushed = asm.take_overrun();
        assert_eq!(flushed.len(), geometry().ring_depth);
        assert!(flushed.iter().all(|r| r.blocks_received == 1));
        assert!(flushed.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(flushed.last().unwrap().seq, old_newest);

        assert_eq!(asm.gauge(), 0);
        assert_eq!(asm.cursor(), asm.newest());
        for i in 1..4 {
            ingest(&mut asm, &after[0][i], 1);
        }
        assert_eq!(asm.front().unwrap().state(), SlotState::Complete);
        assert!(asm.take_overrun().is_empty());
    }

    #[test]
    fn test_late_block_within_ring_is_not_a_discontinuity() {
        let slices = slices(12);
        let mut asm = SliceAssembler::new(geometry(), 100);
        for slice in &slices {
            ingest(&mut asm, &slice[1], 0);
        }
        assert_eq!(ingest(&mut asm, &slices[3][2], 0), SlotEvent::Late);
        assert_eq!(asm.discontinuities(), 0);
    }

    #[test]
    fn test_reset() {
        let slices = slices(1);
        let mut asm = SliceAssembler::new(geometry(), 8);
        ingest(&mut asm, &slices[0][0], 0);
        asm.reset();
        assert!(asm.front().is_none());
        assert_eq!(asm.gauge(), 0);
        assert_eq!(asm.cursor(), None);
    }
}
