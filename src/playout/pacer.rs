//! Playout pacer
//!
//! Driven by the master clock. Each tick accrues a sample budget from the
//! stream's sample rate and releases slices from the assembler cursor while
//! the budget lasts. Lost slices are concealed, a growing backlog is shed
//! and starvation is bridged by repeating the last slice.

use std::time::Duration;
use tracing::{debug, warn};

use super::samples::{convert, remote_bits, ChunkOrigin, SampleChunk};
use super::sink::SampleSink;
use crate::buffer::{RetireReason, SliceAssembler, SliceSlot, SlotState};
use crate::config::{Geometry, LossPolicy, PlayoutConfig};
use crate::constants::{MAX_BUDGET_SLICES, MAX_RATE_CORRECTION};
use crate::protocol::SliceMetadata;
use crate::session::SessionStats;

/// Smoothing factor of the buffer gauge average
const GAUGE_EMA_ALPHA: f64 = 0.1;

/// What to do with the slice at the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrontAction {
    /// Ready with usable metadata
    Deliver,
    /// Lost; play a substitute
    Conceal,
    /// Lost and nothing is known about the stream; drop silently
    Drop,
    /// Wait for more blocks
    Hold,
}

/// Paces delivery of assembled slices to a sink
pub struct Pacer {
    config: PlayoutConfig,
    geometry: Geometry,
    /// Samples that may still be released, negative when in debt
    budget: f64,
    /// Prebuffer threshold reached
    started: bool,
    /// At least one chunk delivered
    streaming: bool,
    last_meta: Option<SliceMetadata>,
    last_chunk: Option<SampleChunk>,
    gauge_ema: f64,
    ticks_above_high_water: u64,
    last_adjust_tick: Option<u64>,
    /// Tick since which the cursor slice has been missing while newer ones exist
    absent_since: Option<u64>,
    rate_correction: f64,
}

impl Pacer {
    pub fn new(config: PlayoutConfig, geometry: Geometry) -> Self {
        Self {
            config,
            geometry,
            budget: 0.0,
            started: false,
            streaming: false,
            last_meta: None,
            last_chunk: None,
            gauge_ema: 0.0,
            ticks_above_high_water: 0,
            last_adjust_tick: None,
            absent_since: None,
            rate_correction: 1.0,
        }
    }

    /// Run one clock tick; returns the number of chunks handed to the sink
    pub fn tick(
        &mut self,
        now_tick: u64,
        elapsed: Duration,
        assembler: &mut SliceAssembler,
        sink: &dyn SampleSink,
        stats: &SessionStats,
    ) -> usize {
        assembler.expire_overdue(now_tick);
        if assembler.cursor().is_none() {
            return 0;
        }
        self.update_gauge(assembler.gauge());

        if !self.started {
            let front_overdue = assembler
                .front()
                .map_or(false, |slot| slot.is_overdue(now_tick));
            if assembler.buffered() < self.config.prebuffer_slices && !front_overdue {
                return 0;
            }
            debug!(buffered = assembler.buffered(), "prebuffer reached, playout starting");
            self.started = true;
        }

        self.accrue_budget(assembler, elapsed);
        self.shed_backlog(now_tick, assembler, stats);

        let mut delivered = 0;
        loop {
            let action = self.front_action(now_tick, assembler);
            match action {
                FrontAction::Drop => {
                    if let Some(retired) = assembler.advance(RetireReason::Discarded) {
                        debug!(seq = retired.seq, "slice dropped, no stream metadata");
                        stats.record_retired(&retired);
                    }
                    continue;
                }
                FrontAction::Hold => {
                    if self.budget > 0.0 {
                        delivered += self.on_starvation(now_tick, sink, stats);
                    }
                    break;
                }
                FrontAction::Deliver | FrontAction::Conceal if self.budget <= 0.0 => break,
                FrontAction::Deliver | FrontAction::Conceal => {}
            }

            let Some(chunk) = self.build_front_chunk(action, assembler) else {
                break;
            };
            if let Some(retired) = assembler.advance(RetireReason::Played) {
                if retired.is_unrecoverable() {
                    debug!(seq = retired.seq, state = ?retired.state, "slice concealed");
                }
                stats.record_retired(&retired);
            }
            self.emit(chunk, sink, stats);
            delivered += 1;
        }
        delivered
    }

    fn update_gauge(&mut self, gauge: i64) {
        self.gauge_ema += GAUGE_EMA_ALPHA * (gauge as f64 - self.gauge_ema);
    }

    fn accrue_budget(&mut self, assembler: &SliceAssembler, elapsed: Duration) {
        let meta = assembler
            .front()
            .and_then(|slot| slot.meta().copied())
            .or(self.last_meta);
        let Some(meta) = meta else { return };

        let per_slice = self.geometry.samples_per_slice(meta.sample_bytes) as f64;
        self.budget += meta.sample_rate as f64 * elapsed.as_secs_f64() * self.rate_correction;
        self.budget = self.budget.min(MAX_BUDGET_SLICES * per_slice);
    }

    fn cooldown_elapsed(&self, now_tick: u64) -> bool {
        match self.last_adjust_tick {
            Some(at) => now_tick.saturating_sub(at) >= self.config.adapt_cooldown_ticks,
            None => true,
        }
    }

    /// Drop the oldest slice when the smoothed backlog stays above high water
    fn shed_backlog(&mut self, now_tick: u64, assembler: &mut SliceAssembler, stats: &SessionStats) {
        if self.gauge_ema > self.config.high_water_slices as f64 {
            self.ticks_above_high_water += 1;
        } else {
            self.ticks_above_high_water = 0;
        }

        if self.ticks_above_high_water < self.config.adapt_hold_ticks
            || !self.cooldown_elapsed(now_tick)
        {
            return;
        }
        if let Some(retired) = assembler.advance(RetireReason::Skipped) {
            debug!(
                seq = retired.seq,
                gauge = assembler.gauge(),
                ema = self.gauge_ema,
                "backlog above high water, slice skipped"
            );
            stats.record_retired(&retired);
        }
        self.ticks_above_high_water = 0;
        self.last_adjust_tick = Some(now_tick);
    }

    fn meta_for(&self, slot: &SliceSlot) -> Option<SliceMetadata> {
        slot.meta().copied().or(self.last_meta)
    }

    fn front_action(&mut self, now_tick: u64, assembler: &SliceAssembler) -> FrontAction {
        let (Some(cursor), Some(newest)) = (assembler.cursor(), assembler.newest()) else {
            return FrontAction::Hold;
        };

        match assembler.front() {
            Some(slot) => {
                self.absent_since = None;
                let known = self.meta_for(slot).is_some();
                match slot.state() {
                    SlotState::Complete | SlotState::Recovered if known => FrontAction::Deliver,
                    SlotState::Complete | SlotState::Recovered if slot.is_overdue(now_tick) => {
                        FrontAction::Drop
                    }
                    SlotState::Expired if known => FrontAction::Conceal,
                    SlotState::Expired => FrontAction::Drop,
                    _ => FrontAction::Hold,
                }
            }
            None if newest > cursor => {
                let since = *self.absent_since.get_or_insert(now_tick);
                if now_tick - since < self.config.slice_timeout_ticks {
                    FrontAction::Hold
                } else if self.last_meta.is_some() {
                    FrontAction::Conceal
                } else {
                    FrontAction::Drop
                }
            }
            None => FrontAction::Hold,
        }
    }

    fn build_front_chunk(
        &mut self,
        action: FrontAction,
        assembler: &SliceAssembler,
    ) -> Option<SampleChunk> {
        let seq = assembler.cursor()?;
        let local_bits = self.config.local_sample_bits;

        match (action, assembler.front()) {
            (FrontAction::Deliver, Some(slot)) => {
                let meta = self.meta_for(slot)?;
                if let Some(fresh) = slot.meta() {
                    self.last_meta = Some(*fresh);
                }
                let origin = if slot.state() == SlotState::Recovered {
                    ChunkOrigin::Recovered
                } else {
                    ChunkOrigin::Intact
                };
                Some(build_chunk(
                    slot.sample_data(),
                    slot_width(slot, &meta),
                    &meta,
                    local_bits,
                    seq,
                    origin,
                ))
            }
            (FrontAction::Conceal, slot) => {
                let meta = match slot {
                    Some(slot) => self.meta_for(slot)?,
                    None => self.last_meta?,
                };
                if self.config.loss_policy == LossPolicy::RepeatLast {
                    if let Some(last) = &self.last_chunk {
                        return Some(repeat_chunk(last, seq));
                    }
                }
                let chunk = match slot {
                    Some(slot) => build_chunk(
                        slot.sample_data(),
                        slot_width(slot, &meta),
                        &meta,
                        local_bits,
                        seq,
                        ChunkOrigin::Concealed,
                    ),
                    None => {
                        let frames = self.geometry.samples_per_slice(meta.sample_bytes);
                        SampleChunk {
                            samples: vec![0; frames * 2],
                            sample_bits: local_bits,
                            sample_rate: meta.sample_rate,
                            center_frequency: meta.center_frequency,
                            timestamp_us: meta.timestamp_us,
                            sequence: seq,
                            origin: ChunkOrigin::Concealed,
                        }
                    }
                };
                Some(chunk)
            }
            _ => None,
        }
    }

    /// Nothing deliverable while budget remains
    fn on_starvation(&mut self, now_tick: u64, sink: &dyn SampleSink, stats: &SessionStats) -> usize {
        if !self.streaming {
            return 0;
        }
        if self.config.starvation_repeat && self.cooldown_elapsed(now_tick) {
            if let Some(last) = &self.last_chunk {
                let chunk = repeat_chunk(last, last.sequence);
                debug!(seq = chunk.sequence, "starving, repeating last slice");
                stats.record_repeat();
                self.last_adjust_tick = Some(now_tick);
                self.emit(chunk, sink, stats);
                return 1;
            }
        }
        stats.record_underrun();
        0
    }

    fn emit(&mut self, chunk: SampleChunk, sink: &dyn SampleSink, stats: &SessionStats) {
        let frames = chunk.frames();
        self.budget -= frames as f64;
        self.streaming = true;
        stats.record_delivery(frames);
        self.last_chunk = Some(chunk.clone());

        let seq = chunk.sequence;
        if !sink.push(chunk) {
            stats.record_sink_drop();
            warn!(seq, "sink full, chunk dropped");
        }
    }

    /// Set the playout rate correction, clamped to the allowed range
    pub fn set_rate_correction(&mut self, correction: f64) {
        self.rate_correction =
            correction.clamp(1.0 - MAX_RATE_CORRECTION, 1.0 + MAX_RATE_CORRECTION);
    }

    pub fn rate_correction(&self) -> f64 {
        self.rate_correction
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Most recent valid metadata delivered
    pub fn last_meta(&self) -> Option<&SliceMetadata> {
        self.last_meta.as_ref()
    }

    pub fn gauge_average(&self) -> f64 {
        self.gauge_ema
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }
}

/// Sample width of a slot, falling back to the metadata
fn slot_width(slot: &SliceSlot, meta: &SliceMetadata) -> u8 {
    match slot.sample_bytes() {
        0 => meta.sample_bytes,
        width => width,
    }
}

fn build_chunk(
    raw: &[u8],
    sample_bytes: u8,
    meta: &SliceMetadata,
    local_bits: u8,
    sequence: u64,
    origin: ChunkOrigin,
) -> SampleChunk {
    let declared = if meta.sample_bytes == sample_bytes { meta.sample_bits } else { 0 };
    let mut samples = Vec::with_capacity(raw.len() / sample_bytes as usize);
    convert(raw, sample_bytes, remote_bits(sample_bytes, declared), local_bits, &mut samples);
    SampleChunk {
        samples,
        sample_bits: local_bits,
        sample_rate: meta.sample_rate,
        center_frequency: meta.center_frequency,
        timestamp_us: meta.timestamp_us,
        sequence,
        origin,
    }
}

fn repeat_chunk(last: &SampleChunk, sequence: u64) -> SampleChunk {
    SampleChunk {
        sequence,
        timestamp_us: last.timestamp_us + last.duration_us(),
        origin: ChunkOrigin::Concealed,
        ..last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SlotEvent;
    use crate::codec::{ErasureDecoder, SliceEncoder};
    use crate::constants::SLICE_INDEX_MODULUS;
    use crate::playout::QueueSink;
    use crate::protocol::{parse, HEADER_LEN};
    use bytes::Bytes;

    const TICK: Duration = Duration::from_millis(1);

    fn geometry() -> Geometry {
        Geometry::new(4, 2, 64, 16)
    }

    /// 48 frames per slice at 48 kHz: one slice per 1 ms tick
    fn meta(n: u64) -> SliceMetadata {
        SliceMetadata {
            center_frequency: 14_200_000,
            sample_rate: 48_000,
            sample_bytes: 2,
            sample_bits: 16,
            original_count: 4,
            fec_count: 2,
            timestamp_us: n * 1_000,
        }
    }

    fn config() -> PlayoutConfig {
        PlayoutConfig {
            slice_timeout_ticks: 4,
            prebuffer_slices: 2,
            high_water_slices: 10,
            adapt_hold_ticks: 3,
            adapt_cooldown_ticks: 5,
            ..PlayoutConfig::default()
        }
    }

    struct Harness {
        asm: SliceAssembler,
        decoder: ErasureDecoder,
        pacer: Pacer,
        sink: QueueSink,
        stats: SessionStats,
        encoder: SliceEncoder,
        tick: u64,
    }

    impl Harness {
        fn new(config: PlayoutConfig) -> Self {
            Self {
                asm: SliceAssembler::new(geometry(), config.slice_timeout_ticks),
                decoder: ErasureDecoder::from_geometry(&geometry()).unwrap(),
                pacer: Pacer::new(config, geometry()),
                sink: QueueSink::new(256),
                stats: SessionStats::new(),
                encoder: SliceEncoder::new(geometry()).unwrap(),
                tick: 0,
            }
        }

        fn slice(&mut self) -> Vec<Bytes> {
            let n = self.encoder.next_slice() as u64;
            let samples: Vec<u8> = (0..self.encoder.slice_payload_bytes())
                .map(|i| (i as u64 + n) as u8)
                .collect();
            self.encoder.encode_slice(&meta(n), &samples).unwrap()
        }

        fn feed(&mut self, datagrams: &[Bytes], keep: &[usize]) {
            for &i in keep {
                let block = parse(&datagrams[i], &geometry()).unwrap();
                if self.asm.ingest(&block, self.tick) == SlotEvent::BecameRecoverable {
                    let seq = self.asm.newest().unwrap();
                    let _ = self.asm.recover(seq, &mut self.decoder);
                }
            }
        }

        fn tick(&mut self) -> usize {
            self.tick += 1;
            self.pacer
                .tick(self.tick, TICK, &mut self.asm, &self.sink, &self.stats)
        }

        fn drain(&self) -> Vec<SampleChunk> {
            std::iter::from_fn(|| self.sink.try_pop()).collect()
        }
    }

    #[test]
    fn test_prebuffer_then_steady_delivery() {
        let mut h = Harness::new(config());
        let s = h.slice();
        h.feed(&s, &[0, 1, 2, 3]);
        assert_eq!(h.tick(), 0);
        assert!(!h.pacer.has_started());

        let s = h.slice();
        h.feed(&s, &[0, 1, 2, 3]);
        assert_eq!(h.tick(), 1);
        assert!(h.pacer.is_streaming());

        for _ in 0..50 {
            let s = h.slice();
            h.feed(&s, &[0, 1, 2, 3, 4, 5]);
            h.tick();
            assert!(h.asm.gauge() <= 3);
        }

        let chunks = h.drain();
        assert!(chunks.len() >= 50);
        assert!(chunks.iter().all(|c| c.origin == ChunkOrigin::Intact));
        assert_eq!(h.stats.unrecoverable(), 0);
        assert_eq!(chunks[0].frames(), 48);
        assert_eq!(chunks[0].center_frequency, 14_200_000);
    }

    #[test]
    fn test_recovered_slice_is_labelled() {
        let mut h = Harness::new(config());
        let s = h.slice();
        h.feed(&s, &[0, 2, 4, 5]);
        let s = h.slice();
        h.feed(&s, &[0, 1, 2, 3]);
        h.tick();

        let chunks = h.drain();
        assert_eq!(chunks[0].origin, ChunkOrigin::Recovered);
        assert_eq!(chunks[0].sequence, h.asm.cursor().unwrap() - 1);
    }

    #[test]
    fn test_expired_slice_is_zero_filled() {
        let mut cfg = config();
        cfg.starvation_repeat = false;
        let mut h = Harness::new(cfg);
        let first = h.slice();
        h.feed(&first, &[0, 1, 2, 3]);
        let lossy = h.slice();
        h.feed(&lossy, &[0, 1]);
        let third = h.slice();
        h.feed(&third, &[0, 1, 2, 3]);

        for _ in 0..8 {
            h.tick();
        }
        let chunks = h.drain();
        let concealed: Vec<_> = chunks.iter().filter(|c| c.is_concealed()).collect();
        assert_eq!(concealed.len(), 1);
        // Block 1 arrived, blocks 2 and 3 read as zeros
        assert!(concealed[0].samples[..32].iter().any(|&s| s != 0));
        assert!(concealed[0].samples[32..].iter().all(|&s| s == 0));
        assert_eq!(h.stats.unrecoverable(), 1);
    }

    #[test]
    fn test_repeat_last_policy() {
        let mut cfg = config();
        cfg.loss_policy = LossPolicy::RepeatLast;
        cfg.starvation_repeat = false;
        let mut h = Harness::new(cfg);
        let first = h.slice();
        h.feed(&first, &[0, 1, 2, 3]);
        let lossy = h.slice();
        h.feed(&lossy, &[4]);
        let third = h.slice();
        h.feed(&third, &[0, 1, 2, 3]);

        for _ in 0..8 {
            h.tick();
        }
        let chunks = h.drain();
        assert_eq!(chunks[1].origin, ChunkOrigin::Concealed);
        assert_eq!(chunks[1].samples, chunks[0].samples);
    }

    #[test]
    fn test_absent_slice_times_out() {
        let mut cfg = config();
        cfg.starvation_repeat = false;
        let mut h = Harness::new(cfg);
        let first = h.slice();
        h.feed(&first, &[0, 1, 2, 3]);
        let _missing = h.slice();
        let third = h.slice();
        h.feed(&third, &[0, 1, 2, 3]);

        h.tick();
        h.tick();
        assert_eq!(h.stats.unrecoverable(), 0);
        for _ in 0..6 {
            h.tick();
        }
        assert_eq!(h.stats.unrecoverable(), 1);
        let chunks = h.drain();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].is_concealed());
    }

    #[test]
    fn test_no_metadata_is_dropped_at_deadline() {
        let mut h = Harness::new(config());
        let s = h.slice();
        // No block 0 and too few blocks to rebuild it
        h.feed(&s, &[1, 2]);
        for _ in 0..6 {
            h.tick();
        }
        assert!(h.drain().is_empty());
        assert_eq!(h.stats.unrecoverable(), 1);
        assert_eq!(h.asm.gauge(), -1);
    }

    fn corrupt_meta_block(datagrams: &mut [Bytes]) {
        let mut block = datagrams[0].to_vec();
        block[HEADER_LEN + 2] ^= 0xff;
        datagrams[0] = Bytes::from(block);
    }

    #[test]
    fn test_complete_slice_without_metadata_is_unrecoverable() {
        let mut h = Harness::new(config());
        let mut s = h.slice();
        corrupt_meta_block(&mut s);
        h.feed(&s, &[0, 1, 2, 3]);
        assert_eq!(h.asm.front().unwrap().state(), SlotState::Complete);

        for _ in 0..9 {
            h.tick();
        }
        assert!(h.drain().is_empty());
        assert_eq!(h.stats.unrecoverable(), 1);
        assert_eq!(h.asm.cursor(), Some(SLICE_INDEX_MODULUS + 1));
    }

    #[test]
    fn test_corrupt_metadata_falls_back_to_last_good() {
        let mut h = Harness::new(config());
        let good = h.slice();
        h.feed(&good, &[0, 1, 2, 3]);

        let n = h.encoder.next_slice() as u64;
        let retuned = SliceMetadata {
            center_frequency: 3_573_000,
            sample_rate: 96_000,
            ..meta(n)
        };
        let samples = vec![0x22u8; h.encoder.slice_payload_bytes()];
        let mut damaged = h.encoder.encode_slice(&retuned, &samples).unwrap();
        corrupt_meta_block(&mut damaged);
        h.feed(&damaged, &[0, 1, 2, 3]);

        h.tick();
        h.tick();
        let chunks = h.drain();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].origin, ChunkOrigin::Intact);
        assert_eq!(chunks[1].sample_rate, 48_000);
        assert_eq!(chunks[1].center_frequency, 14_200_000);
        assert_eq!(chunks[1].samples[0], i16::from_le_bytes([0x22, 0x22]) as i32);
        assert_eq!(h.stats.unrecoverable(), 0);
    }

    #[test]
    fn test_starvation_repeats_once_per_cooldown() {
        let mut h = Harness::new(config());
        for _ in 0..2 {
            let s = h.slice();
            h.feed(&s, &[0, 1, 2, 3]);
        }
        for _ in 0..6 {
            h.tick();
        }
        let snap = h.stats.snapshot();
        assert_eq!(snap.slices_repeated, 1);
        assert!(snap.underruns >= 1);
    }

    #[test]
    fn test_backlog_is_shed() {
        let mut cfg = config();
        cfg.high_water_slices = 2;
        cfg.adapt_hold_ticks = 2;
        let mut h = Harness::new(cfg);
        for _ in 0..12 {
            let s = h.slice();
            h.feed(&s, &[0, 1, 2, 3]);
        }
        for _ in 0..30 {
            h.tick();
        }
        assert!(h.stats.snapshot().slices_skipped >= 1);
    }

    #[test]
    fn test_sink_full_counts_drop() {
        let mut h = Harness::new(config());
        h.sink = QueueSink::new(1);
        for _ in 0..4 {
            let s = h.slice();
            h.feed(&s, &[0, 1, 2, 3]);
        }
        for _ in 0..4 {
            h.tick();
        }
        assert!(h.stats.snapshot().sink_drops >= 1);
    }

    #[test]
    fn test_rate_correction_is_clamped() {
        let mut pacer = Pacer::new(config(), geometry());
        pacer.set_rate_correction(1.5);
        assert!((pacer.rate_correction() - 1.05).abs() < 1e-9);
        pacer.set_rate_correction(0.5);
        assert!((pacer.rate_correction() - 0.95).abs() < 1e-9);
    }
}
