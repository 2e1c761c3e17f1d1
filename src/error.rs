//! Error types for the sample stream receiver

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Datagram parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("Payload size mismatch: declared {declared}, expected {expected}")]
    PayloadSize { declared: usize, expected: usize },

    #[error("Datagram length mismatch: got {actual}, expected {expected}")]
    Length { actual: usize, expected: usize },

    #[error("Geometry mismatch: {original_count}+{fec_count} blocks")]
    Geometry { original_count: u8, fec_count: u8 },

    #[error("Block index {index} out of range ({total} blocks)")]
    BlockIndex { index: u8, total: usize },

    #[error("Unsupported sample width: {0} bytes")]
    SampleBytes(u8),

    #[error("Metadata checksum mismatch")]
    MetaChecksum,
}

/// Erasure coding errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid code parameters")]
    InvalidParams,

    #[error("Insufficient blocks: have {have}, need {need}")]
    InsufficientBlocks { have: usize, need: usize },

    #[error("Duplicate block index {0}")]
    DuplicateIndex(u8),

    #[error("Block size mismatch")]
    BlockSize,

    #[error("Singular recovery matrix")]
    SingularMatrix,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Geometry must be configured before start")]
    NotConfigured,

    #[error("Geometry cannot change while the session is running")]
    GeometryLocked,

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
