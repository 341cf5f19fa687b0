//! Error types for tabsync
//!
//! Almost every variant is recovered locally by the component that sees it;
//! only mutate failures travel back to callers, and only as an indicator
//! they are free to ignore.

use thiserror::Error;

use crate::{ItemId, Namespace};

/// Core tabsync errors
#[derive(Error, Debug)]
pub enum SyncError {
    // Storage errors
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage quota exceeded writing {key} ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    // Fact errors
    #[error("Malformed fact: {0}")]
    MalformedFact(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // Transport errors
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(&'static str),

    // Remote service errors
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Service rejected {item}: {reason}")]
    Remote { item: ItemId, reason: String },

    #[error("Namespace changed while request was in flight: expected {expected}, now {actual}")]
    NamespaceChanged {
        expected: Namespace,
        actual: Namespace,
    },

    // Lifecycle errors
    #[error("Engine not started")]
    NotStarted,

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl SyncError {
    /// Whether the failure is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Storage failures degrade the caller to in-memory operation
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_) | SyncError::QuotaExceeded { .. }
        )
    }
}

/// Result type for tabsync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncError::Network("reset".into()).is_transient());
        assert!(!SyncError::MalformedFact("{".into()).is_transient());
        assert!(SyncError::QuotaExceeded {
            key: "k".into(),
            needed: 10,
            available: 2
        }
        .is_storage());
    }
}
