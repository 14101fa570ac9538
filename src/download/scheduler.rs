//! Admission and retry policy
//!
//! The scheduler decides which tasks may start, when failed tasks get
//! another attempt, and how connectivity changes gate admission. It
//! holds only policy state (backoff deadlines, connectivity, the set of
//! tasks paused by a network drop); all task records live in the queue,
//! and the manager applies whatever the scheduler decides.

use super::error::DownloadError;
use super::queue::TaskQueue;
use super::task::DownloadTask;
use crate::config::QueueConfig;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Source of free-space information for admission checks.
///
/// `None` means the probe cannot answer, in which case admission is
/// optimistic and exhaustion is caught by the transfer itself.
pub trait StorageProbe: Send + Sync {
    fn available_bytes(&self) -> Option<u64>;
}

/// Probe that never constrains admission.
pub struct UnboundedStorage;

impl StorageProbe for UnboundedStorage {
    fn available_bytes(&self) -> Option<u64> {
        None
    }
}

/// Fixed-capacity probe for tests and quota-style deployments.
pub struct FixedStorage(pub u64);

impl StorageProbe for FixedStorage {
    fn available_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// What to do with a task after a transfer failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue; admission is deferred until the backoff expires.
    Retry { delay: Duration },
    /// Retries exhausted or the error is not retryable; leave it failed.
    GiveUp,
}

/// One task the scheduler cleared for admission this pass.
#[derive(Debug, Clone)]
pub struct Admission {
    pub task_id: Uuid,
    pub url: String,
    /// True when the task was paused by a network drop and is being
    /// resumed automatically now that connectivity is back.
    pub auto_resume: bool,
}

pub struct Scheduler {
    config: QueueConfig,
    online: bool,
    /// Backoff deadlines for retried tasks. An entry blocks admission
    /// until its instant passes.
    backoff_until: HashMap<Uuid, Instant>,
    /// Paused tasks cleared to restart: paused by a connectivity drop,
    /// or explicitly resumed by the user. Plain user pauses are never
    /// in here.
    resume_eligible: HashSet<Uuid>,
    storage: Box<dyn StorageProbe>,
}

impl Scheduler {
    pub fn new(config: QueueConfig, storage: Box<dyn StorageProbe>) -> Self {
        Self {
            config,
            online: true,
            backoff_until: HashMap::new(),
            resume_eligible: HashSet::new(),
            storage,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Clear a paused task for restart on the next admission pass.
    /// Used for network-drop pauses and for explicit resume requests.
    pub fn mark_resume_eligible(&mut self, task_id: Uuid) {
        self.resume_eligible.insert(task_id);
    }

    /// Drop a task from all policy bookkeeping (cancelled or removed).
    pub fn forget(&mut self, task_id: Uuid) {
        self.backoff_until.remove(&task_id);
        self.resume_eligible.remove(&task_id);
    }

    /// Decide the fate of a failed transfer. The retry count passed in
    /// is the count after the failure was recorded.
    pub fn on_transfer_error(
        &mut self,
        task_id: Uuid,
        error: &DownloadError,
        retry_count: u32,
    ) -> RetryDecision {
        if !error.is_retryable() {
            tracing::info!("Task {} failed non-retryably: {}", task_id, error);
            return RetryDecision::GiveUp;
        }
        if retry_count >= self.config.retry_ceiling {
            return RetryDecision::GiveUp;
        }
        // Linear backoff scaled by how many times this task has failed.
        let delay = Duration::from_secs(self.config.retry_backoff_secs * retry_count as u64);
        self.backoff_until.insert(task_id, Instant::now() + delay);
        tracing::debug!(
            "Task {} scheduled for retry {} in {:?}",
            task_id,
            retry_count,
            delay
        );
        RetryDecision::Retry { delay }
    }

    fn in_backoff(&self, task_id: Uuid, now: Instant) -> bool {
        self.backoff_until
            .get(&task_id)
            .is_some_and(|deadline| *deadline > now)
    }

    /// Progress-time re-check for optimistically admitted tasks. Unlike
    /// admission, only a hard shortfall counts: the remaining bytes can
    /// no longer fit at all.
    pub fn storage_exhausted(&self, task: &DownloadTask) -> bool {
        match (self.storage.available_bytes(), task.remaining_bytes()) {
            (Some(available), Some(remaining)) => available < remaining,
            _ => false,
        }
    }

    fn storage_allows(&self, task: &DownloadTask) -> bool {
        let Some(available) = self.storage.available_bytes() else {
            return true;
        };
        let needed = task.remaining_bytes().unwrap_or(0);
        available >= needed.saturating_add(self.config.storage_margin_bytes)
    }

    /// One admission pass over the queue. Returns the tasks to start, in
    /// priority order, without mutating any task state; the manager is
    /// responsible for the actual transitions and transfer starts.
    pub async fn admission_pass(&mut self, queue: &TaskQueue) -> Vec<Admission> {
        if !self.online || queue.is_paused().await {
            return Vec::new();
        }

        let active = queue.active_count().await;
        let mut slots = self.config.max_concurrent_downloads.saturating_sub(active);
        if slots == 0 {
            return Vec::new();
        }

        let now = Instant::now();
        let mut admissions = Vec::new();

        // Resume-eligible paused tasks come back first.
        let resume_ids: Vec<Uuid> = self.resume_eligible.iter().copied().collect();
        for id in resume_ids {
            if slots == 0 {
                break;
            }
            let Some(task) = queue.get(id).await else {
                self.resume_eligible.remove(&id);
                continue;
            };
            if task.status != super::task::DownloadStatus::Paused {
                self.resume_eligible.remove(&id);
                continue;
            }
            if !self.storage_allows(&task) {
                tracing::warn!("Deferring resume of {}: insufficient free space", id);
                continue;
            }
            self.resume_eligible.remove(&id);
            slots -= 1;
            admissions.push(Admission {
                task_id: id,
                url: task.source_url,
                auto_resume: true,
            });
        }

        for task in queue.pending_in_order().await {
            if slots == 0 {
                break;
            }
            if self.in_backoff(task.id, now) {
                continue;
            }
            if !self.storage_allows(&task) {
                tracing::warn!(
                    "Deferring admission of {}: insufficient free space",
                    task.id
                );
                continue;
            }
            self.backoff_until.remove(&task.id);
            slots -= 1;
            admissions.push(Admission {
                task_id: task.id,
                url: task.source_url,
                auto_resume: false,
            });
        }

        admissions
    }
}
