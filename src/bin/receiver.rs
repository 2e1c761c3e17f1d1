//! I/Q Stream Receiver
//!
//! Receives an FEC-protected sample stream and hands paced slices to a
//! consumer thread.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_iq_receiver::{
    clock::MasterClock,
    config::ReceiverConfig,
    control::{AppState, ControlServer},
    playout::{ChannelSink, ChunkOrigin, SharedSink},
    session::LinkSession,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting I/Q stream receiver");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ReceiverConfig::load_or_default(config_path.as_deref())
        .context("failed to load configuration")?;

    // Sink consumer runs on its own thread
    let (sink, chunks) = ChannelSink::bounded(config.playout.sink_queue_capacity);
    std::thread::Builder::new()
        .name("sample-consumer".into())
        .spawn(move || {
            let mut concealed = 0u64;
            while let Ok(chunk) = chunks.recv() {
                if chunk.origin == ChunkOrigin::Concealed {
                    concealed += 1;
                }
                tracing::trace!(
                    seq = chunk.sequence,
                    frames = chunk.frames(),
                    origin = ?chunk.origin,
                    "chunk consumed"
                );
            }
            tracing::debug!(concealed, "sample consumer finished");
        })?;

    let mut clock = MasterClock::new(config.playout.tick_interval());
    clock.start();

    let sink: SharedSink = Arc::new(sink);
    let mut session = LinkSession::new(&config, sink);
    session.configure_geometry(config.geometry)?;
    let local = session.start(
        config.network.bind_address,
        config.network.data_port,
        clock.subscribe(),
    )?;
    tracing::info!("Listening for blocks on {}", local);

    let session = Arc::new(Mutex::new(session));

    if config.telemetry.enabled {
        let server = ControlServer::new(AppState::new(
            session.clone(),
            config.clone(),
            clock.ticker(),
        ));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Control server failed: {}", e);
            }
        });
        tracing::info!(
            "Control API available at http://{}:{}",
            config.telemetry.bind_address,
            config.telemetry.http_port
        );
    }

    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_timer.tick() => {
                let (snap, rate, stream_time) = {
                    let session = session.lock();
                    (
                        session.stats().snapshot(),
                        session.rate_correction(),
                        session.stream_timestamp_us(),
                    )
                };
                let stream_time = stream_time
                    .and_then(|us| chrono::DateTime::from_timestamp_micros(us as i64))
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());

                tracing::info!(
                    "Receiver stats: {} complete, {} recovered, {} lost ({:.2}% loss), gauge {}, rate x{:.4}, stream time {}",
                    snap.count_complete,
                    snap.count_recovered,
                    snap.count_unrecoverable,
                    snap.loss_rate() * 100.0,
                    snap.buffer_gauge,
                    rate,
                    stream_time
                );
                if let Ok(json) = serde_json::to_string(&snap) {
                    tracing::debug!(stats = %json, "stats snapshot");
                }
            }
        }
    }

    tracing::info!("Shutting down");
    session.lock().stop();
    clock.stop();
    Ok(())
}
