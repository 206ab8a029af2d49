use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ChunkId, ChunkStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The persisted state disagrees with the input or the output tier.
    /// Never healed automatically.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("chunk {chunk_id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        chunk_id: ChunkId,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single embedding request.
///
/// `Transient` covers timeouts, connection failures, 5xx and 429 and is
/// retried with backoff. `Permanent` covers malformed payloads, count or
/// dimension mismatches and other 4xx; the chunk fails without retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transient error from {endpoint}: {message}")]
    Transient { endpoint: String, message: String },

    #[error("permanent error from {endpoint}: {message}")]
    Permanent { endpoint: String, message: String },
}

impl BackendError {
    pub fn transient(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Transient { endpoint: endpoint.to_string(), message: message.into() }
    }

    pub fn permanent(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Permanent { endpoint: endpoint.to_string(), message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Transient { endpoint, .. } | Self::Permanent { endpoint, .. } => endpoint,
        }
    }
}
