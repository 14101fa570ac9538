use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a single tracked file transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: Uuid,
    pub source_url: String,
    /// Destination bucket the application sorts finished files into.
    pub category: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    /// None until the transfer layer reports an expected size.
    pub total_bytes: Option<u64>,
    pub retry_count: u32,
    /// Set on failure, cleared on any transition out of `Failed`.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Completed` and `Cancelled` are terminal; everything not listed
    /// here is rejected by the queue as a no-op.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Downloading, Failed)
                | (Downloading, Pending)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }

    /// True for states from which no further automatic transition occurs.
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }
}

impl DownloadTask {
    pub fn new(source_url: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.into(),
            category: category.into(),
            status: DownloadStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction downloaded, None while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(1.0);
        }
        Some(self.bytes_downloaded as f64 / total as f64)
    }

    /// Remaining bytes once the total is known.
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.total_bytes
            .map(|total| total.saturating_sub(self.bytes_downloaded))
    }
}
