//! Master clock
//!
//! A single tokio interval broadcasting tick instants. The session worker
//! subscribes and paces playout from it; lagging subscribers skip missed
//! ticks rather than replaying them.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// Ticks buffered per subscriber before it lags
const TICK_CHANNEL_CAPACITY: usize = 16;

/// Periodic tick source
pub struct MasterClock {
    period: Duration,
    tx: broadcast::Sender<Instant>,
    handle: Option<JoinHandle<()>>,
}

impl MasterClock {
    pub fn new(period: Duration) -> Self {
        let (tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        Self {
            period,
            tx,
            handle: None,
        }
    }

    /// Start ticking on the current runtime
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let tx = self.tx.clone();
        let period = self.period;
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let now = interval.tick().await;
                // No subscribers is fine
                let _ = tx.send(now);
            }
        }));
        info!(period_ms = period.as_millis() as u64, "master clock started");
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// New receiver of tick instants
    pub fn subscribe(&self) -> broadcast::Receiver<Instant> {
        self.tx.subscribe()
    }

    /// Sending half, for components that subscribe later
    pub fn ticker(&self) -> broadcast::Sender<Instant> {
        self.tx.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for MasterClock {
    fn drop(&mut self) {
        self.stop();
    }
}
