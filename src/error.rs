//! Typed error kinds for the sync engine.
//!
//! Errors are classified by where the fault lives:
//! - caused by another device's state (lock contention, schema skew,
//!   unknown key version on their side) → retry with backoff
//! - caused by local corruption (integrity, missing key material) →
//!   surface and halt sync for the affected namespace
//! - per-field merge faults → degrade to local-wins and log

use thiserror::Error;

/// All error kinds the engine can produce.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Two vector compactions raced. Local; the caller retries.
    #[error("version vector compaction raced with a concurrent write")]
    VectorCompactionConflict,

    /// No last-synced snapshot exists for a node presumed synced.
    /// Recoverable: the diff is recomputed as a new-node diff.
    #[error("no base snapshot for node {node_id}")]
    ChangeSetBaseMissing { node_id: String },

    /// A numeric merge strategy was applied to non-numeric values.
    /// The merge keeps the local value and logs.
    #[error("strategy {strategy} cannot merge non-numeric values for field {field}")]
    StrategyTypeMismatch { field: String, strategy: String },

    /// The relay namespace lock is held by another device.
    #[error("relay lock held, retry after {retry_after_ms}ms")]
    LockHeld { retry_after_ms: u64 },

    /// Our lock expired server-side mid-operation; the push must retry.
    #[error("relay lock expired")]
    LockExpired,

    /// The relay requires a newer schema version than ours.
    #[error("schema too old: server requires {min_version} ({message})")]
    SchemaTooOld {
        min_version: String,
        upgrade_url: String,
        message: String,
    },

    /// AEAD tag or content checksum mismatch. Tampering or corruption;
    /// never auto-resolved.
    #[error("integrity failure: {context}")]
    IntegrityError { context: String },

    /// A node's encryption_version has no locally known key.
    #[error("unknown key version {version}")]
    KeyVersionMissing { version: u32 },

    /// Rotation verification failed or preconditions were lost.
    /// The old key stays active.
    #[error("key rotation aborted: {reason}")]
    RotationAborted { reason: String },

    /// The offline write queue hit its configured capacity.
    #[error("offline queue full (capacity {capacity})")]
    OfflineQueueFull { capacity: usize },

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization of a payload, vector, or change set failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level failure talking to the relay.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Whether the sync cycle may retry this error with backoff.
    ///
    /// Remote-caused errors retry; local corruption halts the namespace.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LockHeld { .. }
                | SyncError::LockExpired
                | SyncError::VectorCompactionConflict
                | SyncError::Transport(_)
        )
    }

    /// Whether this error must halt sync for the affected namespace
    /// until the user intervenes.
    pub fn halts_namespace(&self) -> bool {
        matches!(
            self,
            SyncError::IntegrityError { .. }
                | SyncError::KeyVersionMissing { .. }
                | SyncError::SchemaTooOld { .. }
        )
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_are_retryable() {
        assert!(SyncError::LockHeld {
            retry_after_ms: 500
        }
        .is_retryable());
        assert!(SyncError::LockExpired.is_retryable());
    }

    #[test]
    fn corruption_halts_namespace() {
        let err = SyncError::IntegrityError {
            context: "checksum mismatch".into(),
        };
        assert!(err.halts_namespace());
        assert!(!err.is_retryable());

        assert!(SyncError::KeyVersionMissing { version: 3 }.halts_namespace());
    }

    #[test]
    fn schema_too_old_is_not_retryable() {
        let err = SyncError::SchemaTooOld {
            min_version: "2".into(),
            upgrade_url: "https://nous.app/upgrade".into(),
            message: "please upgrade".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.halts_namespace());
    }
}
