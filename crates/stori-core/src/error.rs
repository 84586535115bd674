//! Error types for Stori core values

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid tempo: {0} BPM (must be >= 1)")]
    InvalidTempo(f64),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),

    #[error("Invalid time signature: {0}/{1}")]
    InvalidTimeSignature(u8, u8),

    #[error("Invalid cycle region: {start}..{end}")]
    InvalidCycleRegion { start: f64, end: f64 },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
