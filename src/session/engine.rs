//! Session engine
//!
//! Synchronous state machine owned by the session worker. Every datagram
//! and every clock tick passes through here in arrival order, so the ring
//! needs no locking.

use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::rate::RateEstimator;
use super::stats::SessionStats;
use crate::buffer::{SliceAssembler, SlotEvent};
use crate::codec::ErasureDecoder;
use crate::config::{Geometry, PlayoutConfig};
use crate::error::SessionError;
use crate::playout::{Pacer, SampleSink};
use crate::protocol::{parse, MetaStatus};

/// Stream properties visible outside the worker
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub sample_rate: Option<u32>,
    pub center_frequency: Option<u64>,
    pub timestamp_us: Option<u64>,
    pub sample_bits: Option<u8>,
    pub streaming: bool,
    pub rate_correction: f64,
    pub remote_addr: Option<SocketAddr>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: None,
            center_frequency: None,
            timestamp_us: None,
            sample_bits: None,
            streaming: false,
            rate_correction: 1.0,
            remote_addr: None,
        }
    }
}

pub type SharedStreamInfo = Arc<RwLock<StreamInfo>>;

/// Reception and playout state of one running session
pub struct SessionCore {
    assembler: SliceAssembler,
    decoder: ErasureDecoder,
    pacer: Pacer,
    rate: RateEstimator,
    auto_rate_correction: bool,
    tick_interval: Duration,
    stats: Arc<SessionStats>,
    info: SharedStreamInfo,
    remote: Option<SocketAddr>,
    ticks: u64,
    last_tick: Option<Instant>,
}

impl SessionCore {
    pub fn new(
        geometry: Geometry,
        playout: PlayoutConfig,
        stats: Arc<SessionStats>,
        info: SharedStreamInfo,
    ) -> Result<Self, SessionError> {
        geometry.validate()?;
        let decoder = ErasureDecoder::from_geometry(&geometry)
            .map_err(|e| SessionError::InvalidGeometry(e.to_string()))?;

        Ok(Self {
            assembler: SliceAssembler::new(geometry, playout.slice_timeout_ticks),
            decoder,
            auto_rate_correction: playout.auto_rate_correction,
            tick_interval: playout.tick_interval(),
            pacer: Pacer::new(playout, geometry),
            rate: RateEstimator::new(),
            stats,
            info,
            remote: None,
            ticks: 0,
            last_tick: None,
        })
    }

    /// Handle one received datagram
    pub fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        match self.remote {
            None => {
                info!(%from, "sender locked");
                self.remote = Some(from);
                self.info.write().remote_addr = Some(from);
            }
            Some(remote) if remote != from => {
                trace!(%from, %remote, "datagram from foreign sender");
                self.stats.record_foreign();
                return;
            }
            Some(_) => {}
        }

        self.stats.record_datagram(datagram.len());
        let block = match parse(datagram, self.assembler.geometry()) {
            Ok(block) => block,
            Err(e) => {
                debug!(len = datagram.len(), error = %e, "malformed datagram dropped");
                self.stats.record_malformed();
                return;
            }
        };
        if matches!(block.meta, MetaStatus::Corrupt) {
            debug!(slice = block.slice_index, "metadata checksum mismatch");
            self.stats.record_meta_crc_failure();
        }

        let previous_newest = self.assembler.newest();
        let discontinuities = self.assembler.discontinuities();
        let seq = self.assembler.sequence_of(block.slice_index);
        match self.assembler.ingest(&block, self.ticks) {
            SlotEvent::BecameComplete => self.stats.record_complete(),
            SlotEvent::BecameRecoverable => {
                match self.assembler.recover(seq, &mut self.decoder) {
                    Ok(_) => self.stats.record_recovered(),
                    Err(e) => {
                        warn!(seq, error = %e, "slice decode failed");
                        self.stats.record_decode_failure();
                    }
                }
            }
            SlotEvent::DuplicateIgnored => self.stats.record_duplicate(),
            SlotEvent::Late => self.stats.record_late(),
            SlotEvent::Redundant => self.stats.record_redundant(),
            SlotEvent::StillFilling => {}
        }

        if self.assembler.discontinuities() != discontinuities {
            self.stats.record_resync();
            self.rate.reset();
        } else if let Some(newest) = self.assembler.newest() {
            let advanced = match previous_newest {
                Some(previous) => newest.saturating_sub(previous),
                None => 1,
            };
            if advanced > 0 {
                self.rate.observe(advanced, now);
            }
        }

        self.drain_overrun();
        self.stats.set_gauge(self.assembler.gauge());
    }

    /// Run one playout tick; returns the chunks handed to the sink
    pub fn on_tick(&mut self, now: Instant, sink: &dyn SampleSink) -> usize {
        self.ticks += 1;
        let elapsed = match self.last_tick {
            Some(last) => now.saturating_duration_since(last),
            None => self.tick_interval,
        };
        self.last_tick = Some(now);

        if self.auto_rate_correction {
            if let Some(correction) = self.nominal_slice_rate().and_then(|r| self.rate.correction(r)) {
                self.pacer.set_rate_correction(correction);
            }
        }

        let delivered = self
            .pacer
            .tick(self.ticks, elapsed, &mut self.assembler, sink, &self.stats);
        self.drain_overrun();
        self.stats.set_gauge(self.assembler.gauge());
        self.publish_info();
        delivered
    }

    fn nominal_slice_rate(&self) -> Option<f64> {
        let meta = self.pacer.last_meta()?;
        let per_slice = self.assembler.geometry().samples_per_slice(meta.sample_bytes);
        (per_slice > 0).then(|| meta.sample_rate as f64 / per_slice as f64)
    }

    fn drain_overrun(&mut self) {
        for retired in self.assembler.take_overrun() {
            self.stats.record_retired(&retired);
        }
    }

    fn publish_info(&self) {
        let mut info = self.info.write();
        if let Some(meta) = self.pacer.last_meta() {
            info.sample_rate = Some(meta.sample_rate);
            info.center_frequency = Some(meta.center_frequency);
            info.timestamp_us = Some(meta.timestamp_us);
            info.sample_bits = Some(meta.sample_bits);
        }
        info.streaming = self.pacer.is_streaming();
        info.rate_correction = self.pacer.rate_correction();
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn assembler(&self) -> &SliceAssembler {
        &self.assembler
    }
}
