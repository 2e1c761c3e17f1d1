//! Arrival rate estimation
//!
//! Counts new slices per wall-clock window and smooths the observed slice
//! rate. The playout correction is the ratio of the observed rate to the
//! rate the stream declares.

use std::time::{Duration, Instant};

use crate::constants::MAX_RATE_CORRECTION;

/// Shortest window an observation is taken over
const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Smoothing factor applied per window
const RATE_EMA_ALPHA: f64 = 0.2;

/// Smoothed slice arrival rate
#[derive(Debug, Default)]
pub struct RateEstimator {
    window_start: Option<Instant>,
    window_slices: u64,
    /// Slices per second
    smoothed: Option<f64>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for `new_slices` sequence numbers first seen at `now`
    pub fn observe(&mut self, new_slices: u64, now: Instant) {
        let Some(start) = self.window_start else {
            // Window opens at the first slice; it is not counted
            self.window_start = Some(now);
            return;
        };
        self.window_slices += new_slices;

        let elapsed = now.saturating_duration_since(start);
        if elapsed < MIN_WINDOW {
            return;
        }
        let rate = self.window_slices as f64 / elapsed.as_secs_f64();
        self.smoothed = Some(match self.smoothed {
            Some(prev) => prev + RATE_EMA_ALPHA * (rate - prev),
            None => rate,
        });
        self.window_start = Some(now);
        self.window_slices = 0;
    }

    /// Observed slices per second, once a full window has elapsed
    pub fn slice_rate(&self) -> Option<f64> {
        self.smoothed
    }

    /// Playout correction for a stream declaring `nominal` slices per second
    pub fn correction(&self, nominal: f64) -> Option<f64> {
        if nominal <= 0.0 {
            return None;
        }
        let observed = self.smoothed?;
        Some((observed / nominal).clamp(1.0 - MAX_RATE_CORRECTION, 1.0 + MAX_RATE_CORRECTION))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
