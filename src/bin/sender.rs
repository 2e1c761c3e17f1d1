//! I/Q Stream Sender
//!
//! Generates a synthetic complex tone, encodes it into FEC-protected
//! slices and streams them to a receiver over UDP. An optional drop
//! pattern discards every Nth datagram for loss testing.
//!
//! Usage: sender [TARGET_ADDR] [DROP_EVERY]

use anyhow::{Context, Result};
use std::f64::consts::TAU;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_iq_receiver::{
    codec::SliceEncoder,
    config::Geometry,
    constants::DEFAULT_DATA_PORT,
    network::BlockSender,
    protocol::SliceMetadata,
};

const SAMPLE_RATE: u32 = 192_000;
const CENTER_FREQUENCY: u64 = 14_074_000;
const TONE_OFFSET_HZ: f64 = 1_000.0;
const SAMPLE_BYTES: u8 = 2;

/// Complex exponential at a fixed offset
struct ToneGenerator {
    phase: f64,
    step: f64,
    amplitude: f64,
}

impl ToneGenerator {
    fn new(offset_hz: f64, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * offset_hz / sample_rate as f64,
            amplitude: i16::MAX as f64 * 0.5,
        }
    }

    /// Fill `out` with interleaved little-endian i16 I/Q pairs
    fn fill(&mut self, out: &mut [u8]) {
        for pair in out.chunks_exact_mut(4) {
            let i = (self.phase.cos() * self.amplitude) as i16;
            let q = (self.phase.sin() * self.amplitude) as i16;
            pair[..2].copy_from_slice(&i.to_le_bytes());
            pair[2..].copy_from_slice(&q.to_le_bytes());
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting I/Q stream sender");

    let target: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_DATA_PORT))
        .parse()
        .context("invalid target address")?;
    let drop_every: u64 = std::env::args()
        .nth(2)
        .map(|s| s.parse())
        .transpose()
        .context("invalid drop interval")?
        .unwrap_or(0);

    let geometry = Geometry::default();
    geometry.validate()?;
    let mut encoder = SliceEncoder::new(geometry)?;
    let sender = BlockSender::connect(target).await?;

    let frames = geometry.samples_per_slice(SAMPLE_BYTES);
    let slice_period = Duration::from_secs_f64(frames as f64 / SAMPLE_RATE as f64);
    tracing::info!(
        "Streaming to {}: {} + {} blocks of {} bytes, {} samples/slice ({:.1}ms)",
        target,
        geometry.original_count,
        geometry.fec_count,
        geometry.block_size,
        frames,
        slice_period.as_secs_f64() * 1000.0
    );
    if drop_every > 0 {
        tracing::info!("Dropping every {} datagrams", drop_every);
    }

    let mut tone = ToneGenerator::new(TONE_OFFSET_HZ, SAMPLE_RATE);
    let mut samples = vec![0u8; encoder.slice_payload_bytes()];
    let mut interval = tokio::time::interval(slice_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut datagram_count: u64 = 0;
    let mut dropped: u64 = 0;

    tracing::info!("Starting main loop - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }

        tone.fill(&mut samples);
        let meta = SliceMetadata {
            center_frequency: CENTER_FREQUENCY,
            sample_rate: SAMPLE_RATE,
            sample_bytes: SAMPLE_BYTES,
            sample_bits: 16,
            original_count: geometry.original_count,
            fec_count: geometry.fec_count,
            timestamp_us: now_us(),
        };
        let datagrams = match encoder.encode_slice(&meta, &samples) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Encoding failed: {}", e);
                continue;
            }
        };

        for datagram in &datagrams {
            datagram_count += 1;
            if drop_every > 0 && datagram_count % drop_every == 0 {
                dropped += 1;
                continue;
            }
            if let Err(e) = sender.send(datagram).await {
                tracing::warn!("Failed to send block: {}", e);
            }
        }

        let stats = encoder.stats();
        if stats.slices_encoded % 100 == 0 {
            let sender_stats = sender.stats();
            tracing::info!(
                "Stats: {} slices encoded, {} datagrams sent, {} dropped, {:.1} KB sent",
                stats.slices_encoded,
                sender_stats.datagrams_sent,
                dropped,
                sender_stats.bytes_sent as f64 / 1024.0
            );
        }
    }

    tracing::info!("Sender stopped");
    Ok(())
}
