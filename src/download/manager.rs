//! Download manager: orchestration over queue, scheduler, and transfer
//!
//! The manager is the only component that talks to the transfer port.
//! It runs reconciliation at launch, then serializes everything through
//! one event loop: transfer events from the port's channel, plus a
//! periodic tick that re-runs admission so backoff expiries and freed
//! slots are picked up.

use super::error::DownloadError;
use super::history::{History, HistoryEntry};
use super::persistence::StatePersistence;
use super::progress::{ProgressAggregator, ProgressSummary};
use super::queue::TaskQueue;
use super::reconcile::{self, ReconcileReport};
use super::resume_store::ResumeDataStore;
use super::scheduler::{RetryDecision, Scheduler};
use super::task::{DownloadStatus, DownloadTask};
use super::transfer::{TransferEvent, TransferPort};
use crate::config::QueueConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Called once per completed task with the temp payload location.
/// Post-processing (checksums, unpacking, moving into the category
/// folder) happens behind this.
pub type CompletionHook = Arc<dyn Fn(Uuid, PathBuf) + Send + Sync>;

/// Called when the transfer layer signals a drained event batch, so an
/// OS-held completion token can be released.
pub type DrainHook = Arc<dyn Fn() + Send + Sync>;

pub struct DownloadManager {
    queue: TaskQueue,
    scheduler: Mutex<Scheduler>,
    persistence: StatePersistence,
    resume_store: Arc<ResumeDataStore>,
    progress: StdMutex<ProgressAggregator>,
    history: StdMutex<History>,
    history_path: Option<PathBuf>,
    port: Arc<dyn TransferPort>,
    completion_hook: StdMutex<Option<CompletionHook>>,
    drain_hook: StdMutex<Option<DrainHook>>,
    tick_interval: Duration,
}

impl DownloadManager {
    pub fn new(
        config: QueueConfig,
        scheduler: Scheduler,
        persistence: StatePersistence,
        resume_store: Arc<ResumeDataStore>,
        port: Arc<dyn TransferPort>,
        history_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let history = match &history_path {
            Some(path) => History::load(path, config.history_cap).unwrap_or_else(|e| {
                tracing::warn!("History unreadable, starting empty: {}", e);
                History::new(config.history_cap)
            }),
            None => History::new(config.history_cap),
        };
        Arc::new(Self {
            queue: TaskQueue::new(),
            scheduler: Mutex::new(scheduler),
            persistence,
            resume_store,
            progress: StdMutex::new(ProgressAggregator::new()),
            history: StdMutex::new(history),
            history_path,
            port,
            completion_hook: StdMutex::new(None),
            drain_hook: StdMutex::new(None),
            tick_interval: Duration::from_millis(config.tick_interval_ms),
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.completion_hook.lock().unwrap() = Some(hook);
    }

    pub fn set_drain_hook(&self, hook: DrainHook) {
        *self.drain_hook.lock().unwrap() = Some(hook);
    }

    /// Reconcile persisted state against the native transfer layer, then
    /// start the event loop. Must be called exactly once, before any
    /// other operation.
    pub async fn launch(
        self: Arc<Self>,
        events: mpsc::Receiver<TransferEvent>,
    ) -> anyhow::Result<ReconcileReport> {
        let report = reconcile::run(
            &self.queue,
            &self.persistence,
            self.resume_store.as_ref(),
            self.port.as_ref(),
        )
        .await;

        // Transfers that finished while we were away still owe their
        // post-processing run.
        for (id, location) in &report.completed {
            if let Some(task) = self.queue.get(*id).await {
                self.record_history(&task, true);
            }
            if let Err(e) = self.resume_store.delete(*id).await {
                tracing::warn!("Failed to drop resume blob for {}: {}", id, e);
            }
            self.fire_completion(*id, location.clone());
        }

        self.persistence.flush(&self.queue).await?;
        self.schedule_pass().await;

        tokio::spawn(async move {
            self.event_loop(events).await;
        });
        Ok(report)
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransferEvent>) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::debug!("Transfer event channel closed, stopping loop");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.schedule_pass().await;
                }
            }
        }
    }

    async fn handle_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                task_id,
                bytes_downloaded,
                total_bytes,
            } => {
                if self
                    .queue
                    .mark_progress(task_id, bytes_downloaded, total_bytes)
                    .await
                {
                    self.progress
                        .lock()
                        .unwrap()
                        .update(task_id, bytes_downloaded, total_bytes);
                    self.enforce_storage(task_id).await;
                    self.persistence.schedule_save(&self.queue);
                }
            }
            TransferEvent::Finished {
                task_id,
                temp_location,
            } => {
                let Some(task) = self.queue.mark_completed(task_id).await else {
                    tracing::debug!("Finished event for {} ignored", task_id);
                    return;
                };
                self.progress.lock().unwrap().task_completed(task_id);
                if let Err(e) = self.resume_store.delete(task_id).await {
                    tracing::warn!("Failed to drop resume blob for {}: {}", task_id, e);
                }
                self.record_history(&task, true);
                self.fire_completion(task_id, temp_location);
                self.persistence.schedule_save(&self.queue);
                self.schedule_pass().await;
            }
            TransferEvent::Failed {
                task_id,
                error,
                resume_data,
            } => {
                if let Some(blob) = resume_data {
                    if let Err(e) = self.resume_store.save(task_id, &blob).await {
                        tracing::warn!("Failed to save resume blob for {}: {}", task_id, e);
                    }
                }
                let Some(task) = self.queue.mark_failed(task_id, error.to_string()).await else {
                    tracing::debug!("Failed event for {} ignored", task_id);
                    return;
                };
                self.progress.lock().unwrap().task_failed(task_id);
                let decision = self
                    .scheduler
                    .lock()
                    .await
                    .on_transfer_error(task_id, &error, task.retry_count);
                match decision {
                    RetryDecision::Retry { delay } => {
                        tracing::info!(
                            "Task {} failed ({}), retry {} in {:?}",
                            task_id,
                            error,
                            task.retry_count,
                            delay
                        );
                        self.queue.retry(task_id, false).await;
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!("Task {} failed permanently: {}", task_id, error);
                        self.record_history(&task, false);
                    }
                }
                self.persistence.schedule_save(&self.queue);
                self.schedule_pass().await;
            }
            TransferEvent::AllEventsDelivered => {
                let hook = self.drain_hook.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook();
                }
            }
        }
    }

    /// Run one admission pass and start whatever the scheduler cleared.
    async fn schedule_pass(&self) {
        let admissions = self.scheduler.lock().await.admission_pass(&self.queue).await;
        if admissions.is_empty() {
            return;
        }
        for admission in admissions {
            if !self.queue.mark_started(admission.task_id).await {
                continue;
            }
            let resume_data = self.resume_store.load(admission.task_id).await;
            let used_resume = resume_data.is_some();
            match self
                .port
                .start(admission.task_id, &admission.url, resume_data)
                .await
            {
                Ok(()) => {
                    // The continuation is consumed. A blob left behind
                    // would claim resumability for a running transfer and
                    // feed a stale offset to the next start after a crash.
                    if used_resume {
                        if let Err(e) = self.resume_store.delete(admission.task_id).await {
                            tracing::warn!(
                                "Failed to drop resume blob for {}: {}",
                                admission.task_id,
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to start transfer for {}: {}",
                        admission.task_id,
                        e
                    );
                    if let Some(task) = self
                        .queue
                        .mark_failed(admission.task_id, e.to_string())
                        .await
                    {
                        let decision = self.scheduler.lock().await.on_transfer_error(
                            admission.task_id,
                            &e,
                            task.retry_count,
                        );
                        if decision != RetryDecision::GiveUp {
                            self.queue.retry(admission.task_id, false).await;
                        } else {
                            self.record_history(&task, false);
                        }
                    }
                }
            }
        }
        self.persistence.schedule_save(&self.queue);
    }

    // ---- user operations ----

    /// Enqueue a new download and admit it immediately if a slot is free.
    pub async fn add_download(
        &self,
        url: impl Into<String>,
        category: impl Into<String>,
    ) -> Uuid {
        let task = DownloadTask::new(url, category);
        let id = task.id;
        self.queue.add(task).await;
        self.persistence.schedule_save(&self.queue);
        self.schedule_pass().await;
        id
    }

    /// Suspend an active download, capturing resume data when the
    /// transfer layer can produce it.
    pub async fn pause_task(&self, id: Uuid) {
        let Some(task) = self.queue.get(id).await else {
            return;
        };
        if task.status != DownloadStatus::Downloading {
            tracing::debug!("pause_task: {} is {:?}, ignoring", id, task.status);
            return;
        }
        if let Some(blob) = self.port.cancel(id, true).await {
            if let Err(e) = self.resume_store.save(id, &blob).await {
                tracing::warn!("Failed to save resume blob for {}: {}", id, e);
            }
        }
        self.queue.mark_paused(id).await;
        self.progress.lock().unwrap().task_failed(id);
        self.persistence.schedule_save(&self.queue);
        self.schedule_pass().await;
    }

    /// Request restart of a paused download. Admission happens on the
    /// next pass, subject to the concurrency ceiling.
    pub async fn resume_task(&self, id: Uuid) {
        let Some(task) = self.queue.get(id).await else {
            return;
        };
        if task.status != DownloadStatus::Paused {
            tracing::debug!("resume_task: {} is {:?}, ignoring", id, task.status);
            return;
        }
        self.scheduler.lock().await.mark_resume_eligible(id);
        self.schedule_pass().await;
    }

    /// Cancel a download from any non-terminal state. Resume data is
    /// discarded; the record stays until explicitly removed.
    pub async fn cancel_task(&self, id: Uuid) {
        self.port.cancel(id, false).await;
        let Some(task) = self.queue.cancel(id).await else {
            return;
        };
        self.scheduler.lock().await.forget(id);
        self.progress.lock().unwrap().task_failed(id);
        if let Err(e) = self.resume_store.delete(id).await {
            tracing::warn!("Failed to drop resume blob for {}: {}", id, e);
        }
        self.record_history(&task, false);
        self.persistence.schedule_save(&self.queue);
        self.schedule_pass().await;
    }

    /// User-initiated do-over of a failed task: retry count resets.
    pub async fn retry_task(&self, id: Uuid) {
        if self.queue.retry(id, true).await {
            self.scheduler.lock().await.forget(id);
            self.persistence.schedule_save(&self.queue);
            self.schedule_pass().await;
        }
    }

    /// Drop a task record entirely, aborting its transfer if needed.
    pub async fn remove_download(&self, id: Uuid) {
        if let Some(task) = self.queue.get(id).await {
            if task.status == DownloadStatus::Downloading {
                self.port.cancel(id, false).await;
            }
        }
        if self.queue.remove(id).await.is_some() {
            self.scheduler.lock().await.forget(id);
            self.progress.lock().unwrap().task_failed(id);
            if let Err(e) = self.resume_store.delete(id).await {
                tracing::warn!("Failed to drop resume blob for {}: {}", id, e);
            }
            self.persistence.schedule_save(&self.queue);
            self.schedule_pass().await;
        }
    }

    /// Set the queue-wide pause flag. Running transfers are unaffected;
    /// only admission stops.
    pub async fn set_queue_paused(&self, paused: bool) {
        self.queue.set_paused(paused).await;
        self.persistence.schedule_save(&self.queue);
        if !paused {
            self.schedule_pass().await;
        }
    }

    /// Connectivity change. Loss pauses every active transfer with
    /// resume capture; restoration resumes them automatically.
    pub async fn network_changed(&self, online: bool) {
        self.scheduler.lock().await.set_online(online);
        if online {
            tracing::info!("Network restored, resuming paused transfers");
            self.schedule_pass().await;
            return;
        }
        tracing::warn!("Network lost, pausing active transfers");
        for task in self.queue.all().await {
            if task.status != DownloadStatus::Downloading {
                continue;
            }
            if let Some(blob) = self.port.cancel(task.id, true).await {
                if let Err(e) = self.resume_store.save(task.id, &blob).await {
                    tracing::warn!("Failed to save resume blob for {}: {}", task.id, e);
                }
            }
            self.queue.mark_paused(task.id).await;
            self.progress.lock().unwrap().task_failed(task.id);
            self.scheduler.lock().await.mark_resume_eligible(task.id);
        }
        self.persistence.schedule_save(&self.queue);
    }

    // ---- read side ----

    pub async fn get_task(&self, id: Uuid) -> Option<DownloadTask> {
        self.queue.get(id).await
    }

    pub async fn all_tasks(&self) -> Vec<DownloadTask> {
        self.queue.all().await
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        self.progress.lock().unwrap().summary()
    }

    pub fn get_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().get_history(limit)
    }

    pub fn clear_history(&self) {
        let snapshot = {
            let mut history = self.history.lock().unwrap();
            history.clear_history();
            history.clone()
        };
        self.save_history(&snapshot);
    }

    /// Flush queue state to disk immediately. Called on shutdown.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.persistence.flush(&self.queue).await
    }

    // ---- internals ----

    fn record_history(&self, task: &DownloadTask, success: bool) {
        let snapshot = {
            let mut history = self.history.lock().unwrap();
            history.record(HistoryEntry::from_task(task, success));
            history.clone()
        };
        self.save_history(&snapshot);
    }

    fn save_history(&self, history: &History) {
        if let Some(path) = &self.history_path {
            if let Err(e) = history.save(path) {
                tracing::warn!("Failed to save history: {}", e);
            }
        }
    }

    /// Abort a running transfer whose remaining bytes no longer fit on
    /// disk. Admission is optimistic while the total is unknown, so a
    /// late-arriving total is caught here.
    async fn enforce_storage(&self, task_id: Uuid) {
        let Some(task) = self.queue.get(task_id).await else {
            return;
        };
        if task.status != DownloadStatus::Downloading {
            return;
        }
        if !self.scheduler.lock().await.storage_exhausted(&task) {
            return;
        }
        let error = DownloadError::StorageExhausted(format!(
            "remaining {} bytes exceed available space",
            task.remaining_bytes().unwrap_or(0)
        ));
        tracing::warn!("Aborting task {}: {}", task_id, error);
        if let Some(blob) = self.port.cancel(task_id, true).await {
            if let Err(e) = self.resume_store.save(task_id, &blob).await {
                tracing::warn!("Failed to save resume blob for {}: {}", task_id, e);
            }
        }
        if let Some(task) = self.queue.mark_failed(task_id, error.to_string()).await {
            self.progress.lock().unwrap().task_failed(task_id);
            self.record_history(&task, false);
        }
    }

    fn fire_completion(&self, id: Uuid, location: PathBuf) {
        let hook = self.completion_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(id, location);
        }
    }
}
