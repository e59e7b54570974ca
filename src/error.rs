//! Error types for tiercache
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for tiercache operations
#[derive(Debug, Error)]
pub enum CacheError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Backing Resource Errors
    // -------------------------------------------------------------------------
    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Compaction Errors
    // -------------------------------------------------------------------------
    #[error("Merge failed: {0}")]
    MergeFailure(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CacheError::InvalidArgument(msg.into())
    }
}
