//! Session counters
//!
//! Written only by the session worker, read from anywhere. Every counter is
//! monotonic between resets.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crate::buffer::{RetireReason, RetiredSlice, SlotState};

/// Shared session statistics
#[derive(Debug)]
pub struct SessionStats {
    pub count_complete: AtomicU64,
    pub count_recovered: AtomicU64,
    pub count_unrecoverable: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed_datagrams: AtomicU64,
    pub meta_crc_failures: AtomicU64,
    pub duplicate_blocks: AtomicU64,
    pub late_blocks: AtomicU64,
    pub redundant_blocks: AtomicU64,
    pub foreign_datagrams: AtomicU64,
    pub decode_failures: AtomicU64,
    pub slices_skipped: AtomicU64,
    pub slices_repeated: AtomicU64,
    pub sink_drops: AtomicU64,
    pub underruns: AtomicU64,
    pub chunks_delivered: AtomicU64,
    pub samples_delivered: AtomicU64,
    pub stream_resyncs: AtomicU64,
    /// Slices that held at least one block when retired
    slices_observed: AtomicU64,
    blocks_total: AtomicU64,
    originals_total: AtomicU64,
    recovery_total: AtomicU64,
    min_blocks_per_slice: AtomicUsize,
    min_originals_per_slice: AtomicUsize,
    max_recovery_per_slice: AtomicUsize,
    buffer_gauge: AtomicI64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            count_complete: AtomicU64::new(0),
            count_recovered: AtomicU64::new(0),
            count_unrecoverable: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_datagrams: AtomicU64::new(0),
            meta_crc_failures: AtomicU64::new(0),
            duplicate_blocks: AtomicU64::new(0),
            late_blocks: AtomicU64::new(0),
            redundant_blocks: AtomicU64::new(0),
            foreign_datagrams: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            slices_skipped: AtomicU64::new(0),
            slices_repeated: AtomicU64::new(0),
            sink_drops: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            chunks_delivered: AtomicU64::new(0),
            samples_delivered: AtomicU64::new(0),
            stream_resyncs: AtomicU64::new(0),
            slices_observed: AtomicU64::new(0),
            blocks_total: AtomicU64::new(0),
            originals_total: AtomicU64::new(0),
            recovery_total: AtomicU64::new(0),
            min_blocks_per_slice: AtomicUsize::new(usize::MAX),
            min_originals_per_slice: AtomicUsize::new(usize::MAX),
            max_recovery_per_slice: AtomicUsize::new(0),
            buffer_gauge: AtomicI64::new(0),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_datagram(&self, len: usize) {
        bump(&self.datagrams_received);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        bump(&self.malformed_datagrams);
    }

    pub fn record_meta_crc_failure(&self) {
        bump(&self.meta_crc_failures);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicate_blocks);
    }

    pub fn record_late(&self) {
        bump(&self.late_blocks);
    }

    pub fn record_redundant(&self) {
        bump(&self.redundant_blocks);
    }

    pub fn record_foreign(&self) {
        bump(&self.foreign_datagrams);
    }

    pub fn record_complete(&self) {
        bump(&self.count_complete);
    }

    pub fn record_recovered(&self) {
        bump(&self.count_recovered);
    }

    pub fn record_decode_failure(&self) {
        bump(&self.decode_failures);
    }

    pub fn record_repeat(&self) {
        bump(&self.slices_repeated);
    }

    pub fn record_sink_drop(&self) {
        bump(&self.sink_drops);
    }

    pub fn record_underrun(&self) {
        bump(&self.underruns);
    }

    pub fn record_resync(&self) {
        bump(&self.stream_resyncs);
    }

    pub fn record_delivery(&self, samples: usize) {
        bump(&self.chunks_delivered);
        self.samples_delivered
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    /// Account for a slice leaving the ring
    pub fn record_retired(&self, slice: &RetiredSlice) {
        if slice.reason == RetireReason::Skipped {
            bump(&self.slices_skipped);
        }
        if slice.is_unrecoverable() {
            bump(&self.count_unrecoverable);
        }
        if slice.state == SlotState::Empty {
            return;
        }

        bump(&self.slices_observed);
        self.blocks_total
            .fetch_add(slice.blocks_received as u64, Ordering::Relaxed);
        self.originals_total
            .fetch_add(slice.originals_received as u64, Ordering::Relaxed);
        self.recovery_total
            .fetch_add(slice.blocks_recovered as u64, Ordering::Relaxed);
        self.min_blocks_per_slice
            .fetch_min(slice.blocks_received, Ordering::Relaxed);
        self.min_originals_per_slice
            .fetch_min(slice.originals_received, Ordering::Relaxed);
        self.max_recovery_per_slice
            .fetch_max(slice.blocks_recovered, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, gauge: i64) {
        self.buffer_gauge.store(gauge, Ordering::Relaxed);
    }

    pub fn gauge(&self) -> i64 {
        self.buffer_gauge.load(Ordering::Relaxed)
    }

    pub fn unrecoverable(&self) -> u64 {
        self.count_unrecoverable.load(Ordering::Relaxed)
    }

    /// Consistent-enough copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let observed = load(&self.slices_observed);
        let average = |total: &AtomicU64| {
            if observed == 0 {
                0.0
            } else {
                load(total) as f64 / observed as f64
            }
        };
        let min = |m: &AtomicUsize| match m.load(Ordering::Relaxed) {
            usize::MAX => 0,
            value => value,
        };

        StatsSnapshot {
            count_complete: load(&self.count_complete),
            count_recovered: load(&self.count_recovered),
            count_unrecoverable: load(&self.count_unrecoverable),
            datagrams_received: load(&self.datagrams_received),
            bytes_received: load(&self.bytes_received),
            malformed_datagrams: load(&self.malformed_datagrams),
            meta_crc_failures: load(&self.meta_crc_failures),
            duplicate_blocks: load(&self.duplicate_blocks),
            late_blocks: load(&self.late_blocks),
            redundant_blocks: load(&self.redundant_blocks),
            foreign_datagrams: load(&self.foreign_datagrams),
            decode_failures: load(&self.decode_failures),
            slices_skipped: load(&self.slices_skipped),
            slices_repeated: load(&self.slices_repeated),
            sink_drops: load(&self.sink_drops),
            underruns: load(&self.underruns),
            chunks_delivered: load(&self.chunks_delivered),
            samples_delivered: load(&self.samples_delivered),
            stream_resyncs: load(&self.stream_resyncs),
            min_blocks_per_slice: min(&self.min_blocks_per_slice),
            min_originals_per_slice: min(&self.min_originals_per_slice),
            max_recovery_per_slice: self.max_recovery_per_slice.load(Ordering::Relaxed),
            avg_blocks_per_slice: average(&self.blocks_total),
            avg_originals_per_slice: average(&self.originals_total),
            avg_recovery_per_slice: average(&self.recovery_total),
            buffer_gauge: self.gauge(),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.count_complete,
            &self.count_recovered,
            &self.count_unrecoverable,
            &self.datagrams_received,
            &self.bytes_received,
            &self.malformed_datagrams,
            &self.meta_crc_failures,
            &self.duplicate_blocks,
            &self.late_blocks,
            &self.redundant_blocks,
            &self.foreign_datagrams,
            &self.decode_failures,
            &self.slices_skipped,
            &self.slices_repeated,
            &self.sink_drops,
            &self.underruns,
            &self.chunks_delivered,
            &self.samples_delivered,
            &self.stream_resyncs,
            &self.slices_observed,
            &self.blocks_total,
            &self.originals_total,
            &self.recovery_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_blocks_per_slice.store(usize::MAX, Ordering::Relaxed);
        self.min_originals_per_slice.store(usize::MAX, Ordering::Relaxed);
        self.max_recovery_per_slice.store(0, Ordering::Relaxed);
        self.buffer_gauge.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub count_complete: u64,
    pub count_recovered: u64,
    pub count_unrecoverable: u64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub malformed_datagrams: u64,
    pub meta_crc_failures: u64,
    pub duplicate_blocks: u64,
    pub late_blocks: u64,
    pub redundant_blocks: u64,
    pub foreign_datagrams: u64,
    pub decode_failures: u64,
    pub slices_skipped: u64,
    pub slices_repeated: u64,
    pub sink_drops: u64,
    pub underruns: u64,
    pub chunks_delivered: u64,
    pub samples_delivered: u64,
    pub stream_resyncs: u64,
    pub min_blocks_per_slice: usize,
    pub min_originals_per_slice: usize,
    pub max_recovery_per_slice: usize,
    pub avg_blocks_per_slice: f64,
    pub avg_originals_per_slice: f64,
    pub avg_recovery_per_slice: f64,
    pub buffer_gauge: i64,
}

impl StatsSnapshot {
    /// Fraction of resolved slices that could not be played
    pub fn loss_rate(&self) -> f64 {
        let total = self.count_complete + self.count_recovered + self.count_unrecoverable;
        if total == 0 {
            0.0
        } else {
            self.count_unrecoverable as f64 / total as f64
        }
    }
}
