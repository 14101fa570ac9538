//! Queue change events
//!
//! Observers subscribe to a broadcast stream instead of registering a
//! single delegate. Each state transition emits one ordered batch of
//! events while the queue's write lock is held, so listeners never see
//! two transitions interleaved.

use super::task::DownloadTask;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum QueueEvent {
    TaskAdded(DownloadTask),
    /// Full task record after a state mutation.
    TaskUpdated(DownloadTask),
    /// Emitted in the same batch as the TaskUpdated that changed it.
    ActiveCountChanged(usize),
    TaskCompleted { id: Uuid, bytes_downloaded: u64 },
    TaskFailed { id: Uuid, error: String, retry_count: u32 },
    TaskCancelled { id: Uuid },
    TaskRemoved { id: Uuid },
    QueuePausedChanged(bool),
}
