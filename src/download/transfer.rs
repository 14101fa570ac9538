//! Transfer port contract
//!
//! The core never moves bytes itself. It drives an implementation of
//! [`TransferPort`] — the platform's transfer facility — and consumes
//! its asynchronous events through an mpsc channel handed to the adapter
//! at construction. Adapters run in their own concurrency domain; the
//! manager serializes their events into the queue.

use super::error::DownloadError;
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

/// What the native layer knows about a transfer when enumerated at
/// reconciliation time.
#[derive(Debug, Clone)]
pub enum NativeTransferStatus {
    /// Still moving bytes.
    Active,
    /// Finished while we were not watching; bytes are at `location`.
    Completed { location: PathBuf },
    Failed { error: String },
}

/// One native-layer transfer record, surfaced only at reconciliation.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub task_id: Uuid,
    pub status: NativeTransferStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

/// Asynchronous callbacks delivered by the transfer layer.
#[derive(Debug)]
pub enum TransferEvent {
    Progress {
        task_id: Uuid,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    /// Transfer succeeded; the payload sits at a temporary location the
    /// post-processing pipeline takes ownership of.
    Finished {
        task_id: Uuid,
        temp_location: PathBuf,
    },
    Failed {
        task_id: Uuid,
        error: DownloadError,
        /// Continuation state captured at failure, if any.
        resume_data: Option<Vec<u8>>,
    },
    /// A batch of background-delivered events has fully drained. Used to
    /// release any OS-held completion token.
    AllEventsDelivered,
}

#[async_trait]
pub trait TransferPort: Send + Sync {
    /// Begin (or resume, when `resume_data` is given) a transfer.
    async fn start(
        &self,
        task_id: Uuid,
        url: &str,
        resume_data: Option<Vec<u8>>,
    ) -> Result<(), DownloadError>;

    /// Abort a transfer. When `produce_resume_data` is set, returns the
    /// opaque continuation blob if one could be captured.
    async fn cancel(&self, task_id: Uuid, produce_resume_data: bool) -> Option<Vec<u8>>;

    /// Transfers the native layer still knows about, possibly started
    /// before the current process launch. Used only at reconciliation.
    async fn enumerate_pending_transfers(&self) -> Vec<PendingTransfer>;
}
