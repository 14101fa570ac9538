//! Download error taxonomy
//!
//! Transient errors are absorbed into state transitions and retry
//! scheduling; they are never surfaced to callers as panics or crashes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connectivity loss. Pauses active tasks rather than failing them.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Transient transfer failure, retryable up to the configured ceiling.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Free storage dropped below the safety margin. Requires user action.
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),

    /// Snapshot file missing, unreadable, or malformed. Degrades to an
    /// empty queue at startup, never blocks launch.
    #[error("persisted state unreadable: {0}")]
    PersistenceCorrupt(String),

    /// Persisted intent and native transfer state disagree. Resolved by
    /// the reconciliation policy and logged.
    #[error("reconciliation conflict for task {task_id}: {detail}")]
    ReconciliationConflict { task_id: uuid::Uuid, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl DownloadError {
    /// Whether the scheduler may re-enqueue the task automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transfer(_)
                | DownloadError::NetworkUnavailable
                | DownloadError::Http(_)
                | DownloadError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_errors_are_retryable() {
        assert!(DownloadError::Transfer("timeout".into()).is_retryable());
        assert!(DownloadError::NetworkUnavailable.is_retryable());
    }

    #[test]
    fn test_storage_exhaustion_is_not_retryable() {
        assert!(!DownloadError::StorageExhausted("disk full".into()).is_retryable());
    }

    #[test]
    fn test_persistence_corruption_is_not_retryable() {
        assert!(!DownloadError::PersistenceCorrupt("bad json".into()).is_retryable());
    }
}
