//! Link session
//!
//! Owns the data socket and the worker task that feeds the slice
//! assembler and the playout pacer. Datagrams and clock ticks are
//! serialised onto that one task; everything readable from outside lives
//! in atomics or behind a short read lock.

mod engine;
mod rate;
mod stats;

pub use engine::{SessionCore, SharedStreamInfo, StreamInfo};
pub use rate::RateEstimator;
pub use stats::{SessionStats, StatsSnapshot};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Geometry, PlayoutConfig, ReceiverConfig};
use crate::error::{Error, SessionError};
use crate::network::bind_data_socket;
use crate::playout::SharedSink;

/// Largest datagram the worker accepts
const RECV_BUFFER_LEN: usize = 65_536;

struct Worker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    started_at: DateTime<Utc>,
}

/// One receive session bound to a local UDP port
pub struct LinkSession {
    id: Uuid,
    geometry: Option<Geometry>,
    playout: PlayoutConfig,
    recv_buffer_bytes: usize,
    sink: SharedSink,
    stats: Arc<SessionStats>,
    info: SharedStreamInfo,
    worker: Option<Worker>,
}

impl LinkSession {
    /// Create an idle session; geometry must still be configured
    pub fn new(config: &ReceiverConfig, sink: SharedSink) -> Self {
        Self {
            id: Uuid::new_v4(),
            geometry: None,
            playout: config.playout.clone(),
            recv_buffer_bytes: config.network.recv_buffer_bytes,
            sink,
            stats: Arc::new(SessionStats::new()),
            info: SharedStreamInfo::default(),
            worker: None,
        }
    }

    /// Set the slice geometry; fixed while the session runs
    pub fn configure_geometry(&mut self, geometry: Geometry) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::GeometryLocked);
        }
        geometry.validate()?;
        self.geometry = Some(geometry);
        Ok(())
    }

    /// Bind `address:port` and start receiving
    ///
    /// Each run gets fresh counters and stream info. Ticks from `ticks` drive playout. Must be called
    /// from within a tokio runtime.
    pub fn start(
        &mut self,
        address: IpAddr,
        port: u16,
        ticks: broadcast::Receiver<Instant>,
    ) -> Result<SocketAddr, Error> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning.into());
        }
        let geometry = self.geometry.ok_or(SessionError::NotConfigured)?;

        self.stats = Arc::new(SessionStats::new());
        self.info = SharedStreamInfo::default();

        let core = SessionCore::new(
            geometry,
            self.playout.clone(),
            self.stats.clone(),
            self.info.clone(),
        )?;
        let socket = bind_data_socket(SocketAddr::new(address, port), self.recv_buffer_bytes)?;
        let local_addr = socket.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(core, socket, ticks, shutdown_rx, self.sink.clone()));

        info!(
            session = %self.id,
            %local_addr,
            original_count = geometry.original_count,
            fec_count = geometry.fec_count,
            block_size = geometry.block_size,
            "session started"
        );
        self.worker = Some(Worker {
            handle,
            shutdown,
            local_addr,
            started_at: Utc::now(),
        });
        Ok(local_addr)
    }

    /// Stop receiving and discard all slice state; safe when idle
    ///
    /// Counters and stream info of the stopped run are detached, not reset.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
            info!(session = %self.id, "session stopped");
        }
        self.stats = Arc::new(SessionStats::new());
        self.info = SharedStreamInfo::default();
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Slices between the playout cursor and the newest slice
    pub fn buffer_gauge(&self) -> i64 {
        self.stats.gauge()
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.info.read().sample_rate
    }

    pub fn center_frequency(&self) -> Option<u64> {
        self.info.read().center_frequency
    }

    pub fn stream_timestamp_us(&self) -> Option<u64> {
        self.info.read().timestamp_us
    }

    /// True once a slice has been delivered since start
    pub fn is_streaming(&self) -> bool {
        self.info.read().streaming
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }

    /// First sender seen since start
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.read().remote_addr
    }

    pub fn rate_correction(&self) -> f64 {
        self.info.read().rate_correction
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            running: self.is_running(),
            started_at: self.worker.as_ref().map(|w| w.started_at),
            local_addr: self.local_addr(),
            geometry: self.geometry,
            stream: self.info.read().clone(),
            stats: self.stats.snapshot(),
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
    }
}

/// Serialisable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub local_addr: Option<SocketAddr>,
    pub geometry: Option<Geometry>,
    pub stream: StreamInfo,
    pub stats: StatsSnapshot,
}

async fn run_worker(
    mut core: SessionCore,
    socket: UdpSocket,
    mut ticks: broadcast::Receiver<Instant>,
    mut shutdown: watch::Receiver<bool>,
    sink: SharedSink,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => core.on_datagram(&buf[..len], from, std::time::Instant::now()),
                Err(e) => warn!(error = %e, "receive failed"),
            },
            tick = ticks.recv() => match tick {
                Ok(now) => {
                    core.on_tick(now.into_std(), sink.as_ref());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "worker lagged behind the clock");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("clock stopped, worker exiting");
                    break;
                }
            },
        }
    }
}
