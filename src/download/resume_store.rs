//! Resume-data blob store
//!
//! One file per task id under a dedicated directory. The blob contents
//! are opaque to the core; they belong to the transfer layer. The mere
//! existence of a record signals that a task can restart without
//! re-downloading already-received bytes.

use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

pub struct ResumeDataStore {
    dir: PathBuf,
}

impl ResumeDataStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn blob_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.resume", task_id))
    }

    pub async fn save(&self, task_id: Uuid, data: &[u8]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.blob_path(task_id);
        let temp_path = path.with_extension("resume.tmp");
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        tracing::debug!("Saved {} resume bytes for task {}", data.len(), task_id);
        Ok(())
    }

    pub async fn load(&self, task_id: Uuid) -> Option<Vec<u8>> {
        match tokio::fs::read(self.blob_path(task_id)).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Resume blob unreadable for task {}: {}", task_id, e);
                None
            }
        }
    }

    pub fn has_resume_data(&self, task_id: Uuid) -> bool {
        self.blob_path(task_id).exists()
    }

    pub async fn delete(&self, task_id: Uuid) -> anyhow::Result<()> {
        let path = self.blob_path(task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove blobs whose task id is no longer in the queue. Invoked
    /// after reconciliation and after bulk deletions to bound disk
    /// growth from abandoned transfers.
    pub async fn cleanup_orphaned(&self, valid_task_ids: &HashSet<Uuid>) -> anyhow::Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("resume") {
                continue;
            }
            let owner = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok());
            let orphaned = match owner {
                Some(id) => !valid_task_ids.contains(&id),
                None => true,
            };
            if orphaned {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Failed to remove orphaned resume blob {:?}: {}", path, e);
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!("Removed {} orphaned resume blobs", removed);
        }
        Ok(removed)
    }

    /// Total bytes held across all blobs.
    pub async fn total_size(&self) -> anyhow::Result<u64> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|ext| ext.to_str()) == Some("resume") {
                total += entry.metadata().await?.len();
            }
        }
        Ok(total)
    }
}
