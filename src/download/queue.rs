//! Task queue: single-writer authority over all download task records
//!
//! Every mutation flows through one of the atomic transition operations
//! below. Each operation validates the transition against the state
//! machine, applies it, and emits one ordered batch of events while the
//! write lock is held. Concurrent callers are serialized by the lock,
//! so observers never see a partially-applied transition.

use super::events::QueueEvent;
use super::persistence::QueueSnapshot;
use super::task::{DownloadStatus, DownloadTask};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

struct QueueInner {
    tasks: HashMap<Uuid, DownloadTask>,
    /// Task ids in scheduling priority order, independent of map iteration.
    order: Vec<Uuid>,
    /// Count of tasks currently in `Downloading`.
    active: usize,
    /// Global pause flag: suppresses admission without touching task state.
    is_paused: bool,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<RwLock<QueueInner>>,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(QueueInner {
                tasks: HashMap::new(),
                order: Vec::new(),
                active: 0,
                is_paused: false,
            })),
            events,
        }
    }

    /// Subscribe to queue change events. Any number of listeners.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    /// Add a new task at the back of the queue order.
    ///
    /// Returns false if the id is already tracked; ids are never reused.
    pub async fn add(&self, task: DownloadTask) -> bool {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            tracing::warn!("Refusing to add duplicate task id {}", task.id);
            return false;
        }
        if task.status == DownloadStatus::Downloading {
            inner.active += 1;
        }
        inner.order.push(task.id);
        inner.tasks.insert(task.id, task.clone());
        self.emit(QueueEvent::TaskAdded(task));
        true
    }

    pub async fn get(&self, id: Uuid) -> Option<DownloadTask> {
        let inner = self.inner.read().await;
        inner.tasks.get(&id).cloned()
    }

    /// All tasks in queue order.
    pub async fn all(&self) -> Vec<DownloadTask> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .cloned()
            .collect()
    }

    /// Pending tasks in queue order, ties broken by creation time.
    pub async fn pending_in_order(&self) -> Vec<DownloadTask> {
        let inner = self.inner.read().await;
        let mut pending: Vec<DownloadTask> = inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| t.status == DownloadStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            let pos = |t: &DownloadTask| inner.order.iter().position(|id| *id == t.id);
            pos(a).cmp(&pos(b)).then(a.created_at.cmp(&b.created_at))
        });
        pending
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.read().await.is_paused
    }

    /// Set the global pause flag. Does not change individual task state.
    pub async fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.write().await;
        if inner.is_paused != paused {
            inner.is_paused = paused;
            self.emit(QueueEvent::QueuePausedChanged(paused));
        }
    }

    /// Admit a task: `Pending -> Downloading`, or `Paused -> Downloading`
    /// when resuming.
    pub async fn mark_started(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            tracing::debug!("mark_started: task {} not found, ignoring", id);
            return false;
        };
        if !task.status.can_transition_to(DownloadStatus::Downloading) {
            tracing::debug!(
                "mark_started: task {} in {:?}, transition rejected",
                id,
                task.status
            );
            return false;
        }
        task.status = DownloadStatus::Downloading;
        task.last_error = None;
        task.updated_at = Utc::now();
        if task.started_at.is_none() {
            task.started_at = Some(task.updated_at);
        }
        let snapshot = task.clone();
        inner.active += 1;
        let active = inner.active;
        self.emit(QueueEvent::TaskUpdated(snapshot));
        self.emit(QueueEvent::ActiveCountChanged(active));
        true
    }

    /// Record transfer progress. Only meaningful while downloading; late
    /// callbacks for cancelled tasks are silent no-ops.
    pub async fn mark_progress(&self, id: Uuid, bytes: u64, total: Option<u64>) -> bool {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != DownloadStatus::Downloading {
            tracing::debug!(
                "mark_progress: task {} in {:?}, dropping stale progress",
                id,
                task.status
            );
            return false;
        }
        if let Some(new_total) = total {
            task.total_bytes = Some(new_total);
        }
        task.bytes_downloaded = match task.total_bytes {
            Some(total_bytes) if bytes > total_bytes => {
                tracing::warn!(
                    "Task {} reported {} bytes over a total of {}, clamping",
                    id,
                    bytes,
                    total_bytes
                );
                total_bytes
            }
            _ => bytes,
        };
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.emit(QueueEvent::TaskUpdated(snapshot));
        true
    }

    /// Finalize a successful transfer: `Downloading -> Completed`.
    pub async fn mark_completed(&self, id: Uuid) -> Option<DownloadTask> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id)?;
        if !task.status.can_transition_to(DownloadStatus::Completed) {
            tracing::debug!(
                "mark_completed: task {} in {:?}, transition rejected",
                id,
                task.status
            );
            return None;
        }
        task.status = DownloadStatus::Completed;
        if let Some(total) = task.total_bytes {
            task.bytes_downloaded = total;
        }
        task.retry_count = 0;
        task.last_error = None;
        task.updated_at = Utc::now();
        task.completed_at = Some(task.updated_at);
        let snapshot = task.clone();
        inner.active = inner.active.saturating_sub(1);
        let active = inner.active;
        self.emit(QueueEvent::TaskUpdated(snapshot.clone()));
        self.emit(QueueEvent::ActiveCountChanged(active));
        self.emit(QueueEvent::TaskCompleted {
            id,
            bytes_downloaded: snapshot.bytes_downloaded,
        });
        Some(snapshot)
    }

    /// Record a transfer failure: `Downloading -> Failed`, incrementing
    /// the retry count. Calling this twice for the same failure is safe:
    /// the second call finds the task already failed and does nothing.
    pub async fn mark_failed(&self, id: Uuid, error: impl Into<String>) -> Option<DownloadTask> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id)?;
        if !task.status.can_transition_to(DownloadStatus::Failed) {
            tracing::debug!(
                "mark_failed: task {} in {:?}, transition rejected",
                id,
                task.status
            );
            return None;
        }
        task.status = DownloadStatus::Failed;
        task.retry_count += 1;
        task.last_error = Some(error.into());
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        inner.active = inner.active.saturating_sub(1);
        let active = inner.active;
        self.emit(QueueEvent::TaskUpdated(snapshot.clone()));
        self.emit(QueueEvent::ActiveCountChanged(active));
        self.emit(QueueEvent::TaskFailed {
            id,
            error: snapshot.last_error.clone().unwrap_or_default(),
            retry_count: snapshot.retry_count,
        });
        Some(snapshot)
    }

    /// Suspend an active transfer: `Downloading -> Paused`. Used for
    /// explicit pause and for connectivity loss.
    pub async fn mark_paused(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        if !task.status.can_transition_to(DownloadStatus::Paused) {
            tracing::debug!(
                "mark_paused: task {} in {:?}, transition rejected",
                id,
                task.status
            );
            return false;
        }
        task.status = DownloadStatus::Paused;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        inner.active = inner.active.saturating_sub(1);
        let active = inner.active;
        self.emit(QueueEvent::TaskUpdated(snapshot));
        self.emit(QueueEvent::ActiveCountChanged(active));
        true
    }

    /// Return an active task to the pending pool without touching its
    /// retry count: `Downloading -> Pending`. Used when the native
    /// transfer was dropped underneath us.
    pub async fn requeue(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return false;
        };
        if task.status != DownloadStatus::Downloading {
            return false;
        }
        task.status = DownloadStatus::Pending;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        inner.active = inner.active.saturating_sub(1);
        let active = inner.active;
        self.emit(QueueEvent::TaskUpdated(snapshot));
        self.emit(QueueEvent::ActiveCountChanged(active));
        true
    }

    /// Re-enqueue a failed task: `Failed -> Pending`. `reset_count` is a
    /// user-initiated do-over; automatic retries keep the count.
    pub async fn retry(&self, id: Uuid, reset_count: bool) -> bool {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            tracing::debug!("retry: task {} not found, ignoring", id);
            return false;
        };
        if !task.status.can_transition_to(DownloadStatus::Pending)
            || task.status != DownloadStatus::Failed
        {
            return false;
        }
        task.status = DownloadStatus::Pending;
        task.last_error = None;
        if reset_count {
            task.retry_count = 0;
        }
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.emit(QueueEvent::TaskUpdated(snapshot));
        true
    }

    /// Cancel from any non-terminal state. The queue does not wait for
    /// the transfer layer's abort acknowledgment.
    pub async fn cancel(&self, id: Uuid) -> Option<DownloadTask> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id)?;
        if task.status.is_terminal() {
            tracing::debug!("cancel: task {} already terminal, ignoring", id);
            return None;
        }
        let was_downloading = task.status == DownloadStatus::Downloading;
        task.status = DownloadStatus::Cancelled;
        task.last_error = None;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        let mut active_changed = None;
        if was_downloading {
            inner.active = inner.active.saturating_sub(1);
            active_changed = Some(inner.active);
        }
        self.emit(QueueEvent::TaskUpdated(snapshot.clone()));
        if let Some(active) = active_changed {
            self.emit(QueueEvent::ActiveCountChanged(active));
        }
        self.emit(QueueEvent::TaskCancelled { id });
        Some(snapshot)
    }

    /// Remove a task record entirely. Only explicit removal destroys a
    /// task; nothing is dropped silently.
    pub async fn remove(&self, id: Uuid) -> Option<DownloadTask> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.remove(&id)?;
        inner.order.retain(|existing| *existing != id);
        if task.status == DownloadStatus::Downloading {
            inner.active = inner.active.saturating_sub(1);
            let active = inner.active;
            self.emit(QueueEvent::ActiveCountChanged(active));
        }
        self.emit(QueueEvent::TaskRemoved { id });
        Some(task)
    }

    /// Consistent snapshot of the whole queue for persistence.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.read().await;
        QueueSnapshot {
            tasks: inner
                .order
                .iter()
                .filter_map(|id| inner.tasks.get(id))
                .cloned()
                .collect(),
            queue_order: inner.order.clone(),
            is_paused: inner.is_paused,
            exported_at: Utc::now(),
        }
    }

    /// Replace queue contents from a persisted snapshot. Used once at
    /// startup, before any other mutation.
    pub async fn restore(&self, snapshot: QueueSnapshot) {
        let mut inner = self.inner.write().await;
        inner.tasks = snapshot
            .tasks
            .into_iter()
            .map(|task| (task.id, task))
            .collect();
        // Keep persisted order, appending any task the order list missed.
        let mut order: Vec<Uuid> = snapshot
            .queue_order
            .into_iter()
            .filter(|id| inner.tasks.contains_key(id))
            .collect();
        for id in inner.tasks.keys() {
            if !order.contains(id) {
                order.push(*id);
            }
        }
        inner.order = order;
        inner.is_paused = snapshot.is_paused;
        inner.active = inner
            .tasks
            .values()
            .filter(|t| t.status == DownloadStatus::Downloading)
            .count();
        tracing::info!(
            "Restored {} tasks from snapshot ({} active)",
            inner.tasks.len(),
            inner.active
        );
    }

    /// Ids of all tracked tasks, used for resume-blob orphan cleanup.
    pub async fn task_ids(&self) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        inner.tasks.keys().copied().collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
