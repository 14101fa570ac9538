//! Durable queue snapshots
//!
//! The snapshot is the sole unit of durable state and is always written
//! whole, to a temp file first, then renamed into place. A crash mid-write
//! therefore leaves either the previous valid snapshot or nothing.
//!
//! Saves are debounced: bursts of `schedule_save` calls collapse into a
//! single write, with a bounded maximum delay so a continuously-churning
//! queue still hits disk regularly.

use super::queue::TaskQueue;
use super::task::DownloadTask;
use crate::config::QueueConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Persisted form of the whole queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tasks: Vec<DownloadTask>,
    /// Scheduling priority order, independent of map iteration.
    pub queue_order: Vec<Uuid>,
    pub is_paused: bool,
    pub exported_at: DateTime<Utc>,
}

/// Cheap to clone; all clones share the same debounce timer.
#[derive(Clone)]
pub struct StatePersistence {
    inner: Arc<PersistenceInner>,
}

struct PersistenceInner {
    path: PathBuf,
    debounce: Duration,
    max_delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
    first_dirty: Mutex<Option<Instant>>,
}

impl StatePersistence {
    pub fn new(path: PathBuf, debounce: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(PersistenceInner {
                path,
                debounce,
                max_delay,
                pending: Mutex::new(None),
                first_dirty: Mutex::new(None),
            }),
        }
    }

    /// Build with the configured coalescing windows.
    pub fn from_config(path: PathBuf, config: &QueueConfig) -> Self {
        Self::new(
            path,
            Duration::from_millis(config.save_debounce_ms),
            Duration::from_millis(config.save_max_delay_ms),
        )
    }

    /// Write a snapshot atomically: temp file + rename.
    pub async fn save(&self, snapshot: &QueueSnapshot) -> anyhow::Result<()> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, path).await?;
        tracing::debug!(
            "Saved snapshot of {} tasks to {}",
            snapshot.tasks.len(),
            path.display()
        );
        Ok(())
    }

    /// Load the last fully-written snapshot.
    ///
    /// Missing or unreadable state degrades to None (start fresh) rather
    /// than blocking startup.
    pub async fn load(&self) -> Option<QueueSnapshot> {
        let path = &self.inner.path;
        if !path.exists() {
            tracing::debug!("No snapshot at {}", path.display());
            return None;
        }
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Snapshot unreadable, starting fresh: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<QueueSnapshot>(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Snapshot corrupt, starting fresh: {}", e);
                None
            }
        }
    }

    /// Delete the snapshot file if present.
    pub async fn clear(&self) -> anyhow::Result<()> {
        if self.inner.path.exists() {
            tokio::fs::remove_file(&self.inner.path).await?;
        }
        Ok(())
    }

    /// Request a save soon. Repeated calls within the coalescing window
    /// replace the in-flight timer; the first unsaved change bounds the
    /// total delay.
    pub fn schedule_save(&self, queue: &TaskQueue) {
        let now = Instant::now();
        let deadline = {
            let mut first_dirty = self.inner.first_dirty.lock().unwrap();
            let dirty_since = *first_dirty.get_or_insert(now);
            (now + self.inner.debounce).min(dirty_since + self.inner.max_delay)
        };

        let this = self.clone();
        let queue = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            *this.inner.first_dirty.lock().unwrap() = None;
            let snapshot = queue.snapshot().await;
            if let Err(e) = this.save(&snapshot).await {
                tracing::warn!("Debounced snapshot save failed: {}", e);
            }
        });

        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel any pending debounced save and write immediately.
    pub async fn flush(&self, queue: &TaskQueue) -> anyhow::Result<()> {
        if let Some(previous) = self.inner.pending.lock().unwrap().take() {
            previous.abort();
        }
        *self.inner.first_dirty.lock().unwrap() = None;
        let snapshot = queue.snapshot().await;
        self.save(&snapshot).await
    }
}
