//! Receiver configuration
//!
//! Loaded from a TOML file. The default location follows the platform
//! conventions provided by `directories`.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, SessionError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub network: NetworkConfig,
    pub geometry: Geometry,
    pub playout: PlayoutConfig,
    pub telemetry: TelemetryConfig,
}

/// Data socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the data socket binds to
    pub bind_address: IpAddr,
    /// Data port
    pub data_port: u16,
    /// Kernel receive buffer size requested for the socket
    pub recv_buffer_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            data_port: DEFAULT_DATA_PORT,
            recv_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Slice geometry shared by sender and receiver
///
/// Block 0 of every slice carries metadata; blocks `1..original_count`
/// carry samples; the remaining `fec_count` blocks are parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    pub original_count: u8,
    pub fec_count: u8,
    /// Payload bytes per block
    pub block_size: usize,
    /// Number of slices tracked simultaneously (power of two)
    pub ring_depth: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            original_count: DEFAULT_ORIGINAL_COUNT,
            fec_count: DEFAULT_FEC_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            ring_depth: DEFAULT_RING_DEPTH,
        }
    }
}

impl Geometry {
    pub fn new(original_count: u8, fec_count: u8, block_size: usize, ring_depth: usize) -> Self {
        Self {
            original_count,
            fec_count,
            block_size,
            ring_depth,
        }
    }

    pub fn total_blocks(&self) -> usize {
        self.original_count as usize + self.fec_count as usize
    }

    /// Number of blocks carrying samples
    pub fn data_blocks(&self) -> usize {
        (self.original_count as usize).saturating_sub(1)
    }

    /// Size of a full datagram on the wire
    pub fn datagram_size(&self) -> usize {
        crate::protocol::HEADER_LEN + self.block_size
    }

    /// Complex samples carried by one slice for the given sample width
    pub fn samples_per_slice(&self, sample_bytes: u8) -> usize {
        self.data_blocks() * (self.block_size / (2 * sample_bytes as usize))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: String| Err(SessionError::InvalidGeometry(msg));

        if self.original_count < 2 {
            return invalid(format!("original_count {} < 2", self.original_count));
        }
        if self.total_blocks() > MAX_TOTAL_BLOCKS {
            return invalid(format!(
                "{} total blocks exceeds {}",
                self.total_blocks(),
                MAX_TOTAL_BLOCKS
            ));
        }
        if self.block_size < crate::protocol::META_LEN || self.block_size > MAX_BLOCK_SIZE {
            return invalid(format!("block_size {} out of range", self.block_size));
        }
        if self.block_size % 8 != 0 {
            return invalid(format!("block_size {} is not a multiple of 8", self.block_size));
        }
        if !self.ring_depth.is_power_of_two()
            || self.ring_depth < 2
            || self.ring_depth > MAX_RING_DEPTH
        {
            return invalid(format!(
                "ring_depth {} must be a power of two in 2..={}",
                self.ring_depth, MAX_RING_DEPTH
            ));
        }
        Ok(())
    }
}

/// What to deliver in place of a slice that could not be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPolicy {
    /// Keep the original blocks that arrived, zero the missing ones
    ZeroFill,
    /// Repeat the last delivered slice
    RepeatLast,
}

/// Playout pacing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Master clock period
    pub tick_interval_ms: u64,
    /// Ticks a slice may stay incomplete before it is retired
    pub slice_timeout_ticks: u64,
    /// Slices buffered before playout starts
    pub prebuffer_slices: usize,
    /// Smoothed gauge above this sheds a slice
    pub high_water_slices: usize,
    /// Consecutive ticks above high water before shedding
    pub adapt_hold_ticks: u64,
    /// Minimum ticks between two skip/repeat adjustments
    pub adapt_cooldown_ticks: u64,
    pub loss_policy: LossPolicy,
    /// Repeat the last slice instead of underrunning the sink
    pub starvation_repeat: bool,
    /// Correct the playout rate from the observed arrival rate
    pub auto_rate_correction: bool,
    /// Sample width handed to the sink (16 or 24)
    pub local_sample_bits: u8,
    /// Chunks the sink queue holds before dropping
    pub sink_queue_capacity: usize,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_MS,
            slice_timeout_ticks: 8,
            prebuffer_slices: 4,
            high_water_slices: 12,
            adapt_hold_ticks: 20,
            adapt_cooldown_ticks: 40,
            loss_policy: LossPolicy::ZeroFill,
            starvation_repeat: true,
            auto_rate_correction: true,
            local_sample_bits: 16,
            sink_queue_capacity: 64,
        }
    }
}

impl PlayoutConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// HTTP control / telemetry surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub bind_address: IpAddr,
    pub http_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: IpAddr::from([127, 0, 0, 1]),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl ReceiverConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "lan-iq", "receiver")
            .map(|dirs| dirs.config_dir().join("receiver.toml"))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or the default location, falling back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Write configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.geometry
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let p = &self.playout;
        if p.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be > 0".into()));
        }
        if p.slice_timeout_ticks == 0 {
            return Err(Error::Config("slice_timeout_ticks must be > 0".into()));
        }
        if p.prebuffer_slices >= self.geometry.ring_depth {
            return Err(Error::Config(format!(
                "prebuffer_slices {} must be below ring_depth {}",
                p.prebuffer_slices, self.geometry.ring_depth
            )));
        }
        if !matches!(p.local_sample_bits, 16 | 24) {
            return Err(Error::Config(format!(
                "local_sample_bits {} must be 16 or 24",
                p.local_sample_bits
            )));
        }
        if p.sink_queue_capacity == 0 {
            return Err(Error::Config("sink_queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}
