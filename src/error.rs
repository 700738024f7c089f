//! Error types for the tiered cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Embedded structured store error
    #[error("Structured store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Payload could not be decoded into a cache value
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// Metadata record is missing fields or unreadable
    #[error("Corrupted metadata for key {key}: {reason}")]
    CorruptedMetadata { key: String, reason: String },

    /// Every tier selected for a write failed
    #[error("Write failed on every eligible tier for key {key}: {}", failures.join("; "))]
    AllTiersFailed { key: String, failures: Vec<String> },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("blocking task failed: {}", e))
    }
}
