//! Startup reconciliation
//!
//! After a relaunch the persisted queue records intent, while the
//! transfer layer knows what actually happened in the meantime. This
//! pass restores the snapshot, then walks the native transfer records
//! and corrects every divergence. The native layer's account of a
//! transfer always wins over persisted intent.

use super::persistence::StatePersistence;
use super::queue::TaskQueue;
use super::resume_store::ResumeDataStore;
use super::task::DownloadStatus;
use super::transfer::{NativeTransferStatus, TransferPort};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// What reconciliation found and did, for logging and for the manager
/// to act on (completed tasks still need their post-processing run).
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Tasks restored from the snapshot.
    pub restored: usize,
    /// Tasks that finished while the process was away, with the temp
    /// location of each payload. Post-processing has not run for these.
    pub completed: Vec<(Uuid, PathBuf)>,
    /// Transfers still running natively that we reattached to.
    pub reattached: usize,
    /// Transfers that failed while the process was away.
    pub failed: usize,
    /// Interrupted tasks demoted to paused (resume data available).
    pub demoted_paused: usize,
    /// Interrupted tasks demoted to pending (no resume data).
    pub demoted_pending: usize,
    /// Resume blobs removed because no task owns them anymore.
    pub orphans_removed: usize,
}

pub async fn run(
    queue: &TaskQueue,
    persistence: &StatePersistence,
    resume_store: &ResumeDataStore,
    port: &dyn TransferPort,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    if let Some(snapshot) = persistence.load().await {
        report.restored = snapshot.tasks.len();
        queue.restore(snapshot).await;
    } else {
        tracing::info!("No persisted queue state, starting empty");
    }

    let native = port.enumerate_pending_transfers().await;
    let mut reported: HashSet<Uuid> = HashSet::new();

    for transfer in native {
        let id = transfer.task_id;
        let Some(task) = queue.get(id).await else {
            // The native layer is moving bytes for a task we no longer
            // track. Stop it; nothing will ever consume the result.
            tracing::warn!("Native transfer for unknown task {}, aborting it", id);
            port.cancel(id, false).await;
            continue;
        };
        reported.insert(id);

        match transfer.status {
            NativeTransferStatus::Completed { location } => {
                if task.status != DownloadStatus::Downloading {
                    tracing::warn!(
                        "Task {} persisted as {:?} but completed natively, accepting completion",
                        id,
                        task.status
                    );
                    // A persisted failure has to step through pending
                    // before the forced start is legal.
                    if task.status == DownloadStatus::Failed {
                        queue.retry(id, false).await;
                    }
                    queue.mark_started(id).await;
                }
                if transfer.bytes_downloaded > 0 {
                    queue
                        .mark_progress(id, transfer.bytes_downloaded, transfer.total_bytes)
                        .await;
                }
                if queue.mark_completed(id).await.is_some() {
                    report.completed.push((id, location));
                }
            }
            NativeTransferStatus::Active => {
                if task.status != DownloadStatus::Downloading {
                    tracing::warn!(
                        "Task {} persisted as {:?} but still transferring, reattaching",
                        id,
                        task.status
                    );
                    if task.status == DownloadStatus::Failed {
                        queue.retry(id, false).await;
                    }
                    queue.mark_started(id).await;
                }
                queue
                    .mark_progress(id, transfer.bytes_downloaded, transfer.total_bytes)
                    .await;
                report.reattached += 1;
            }
            NativeTransferStatus::Failed { error } => {
                if task.status != DownloadStatus::Downloading {
                    queue.mark_started(id).await;
                }
                if transfer.bytes_downloaded > 0 {
                    queue
                        .mark_progress(id, transfer.bytes_downloaded, transfer.total_bytes)
                        .await;
                }
                queue.mark_failed(id, error).await;
                report.failed += 1;
            }
        }
    }

    // Tasks persisted mid-transfer that the native layer no longer knows
    // about. Their transfer died with the process; demote them.
    for task in queue.all().await {
        if task.status != DownloadStatus::Downloading || reported.contains(&task.id) {
            continue;
        }
        if resume_store.has_resume_data(task.id) {
            queue.mark_paused(task.id).await;
            report.demoted_paused += 1;
        } else {
            queue.requeue(task.id).await;
            report.demoted_pending += 1;
        }
    }

    let valid: HashSet<Uuid> = queue.task_ids().await.into_iter().collect();
    match resume_store.cleanup_orphaned(&valid).await {
        Ok(removed) => report.orphans_removed = removed,
        Err(e) => tracing::warn!("Resume blob cleanup failed: {}", e),
    }

    tracing::info!(
        "Reconciliation: {} restored, {} completed away, {} reattached, {} failed away, \
         {} paused, {} re-queued, {} orphans removed",
        report.restored,
        report.completed.len(),
        report.reattached,
        report.failed,
        report.demoted_paused,
        report.demoted_pending,
        report.orphans_removed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::fake_transfer::FakeTransferPort;
    use crate::download::task::DownloadTask;
    use crate::download::transfer::PendingTransfer;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        queue: TaskQueue,
        persistence: StatePersistence,
        resume_store: ResumeDataStore,
        port: FakeTransferPort,
        _temp_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        Fixture {
            queue: TaskQueue::new(),
            persistence: StatePersistence::new(
                temp_dir.path().join("queue.json"),
                Duration::from_millis(50),
                Duration::from_millis(200),
            ),
            resume_store: ResumeDataStore::new(temp_dir.path().join("resume")),
            port: FakeTransferPort::new(tx),
            _temp_dir: temp_dir,
        }
    }

    /// Persist a queue holding one task in the given state, then return
    /// its id. The fixture queue is left empty, as after a relaunch.
    async fn persist_one(fixture: &Fixture, status: DownloadStatus) -> Uuid {
        let staging = TaskQueue::new();
        let mut task = DownloadTask::new("https://example.com/f.bin", "datasets");
        task.status = status;
        let id = task.id;
        staging.add(task).await;
        fixture
            .persistence
            .save(&staging.snapshot().await)
            .await
            .unwrap();
        id
    }

    async fn reconcile(fixture: &Fixture) -> ReconcileReport {
        run(
            &fixture.queue,
            &fixture.persistence,
            &fixture.resume_store,
            &fixture.port,
        )
        .await
    }

    #[tokio::test]
    async fn test_fresh_start_without_snapshot() {
        let fixture = fixture();
        let report = reconcile(&fixture).await;
        assert_eq!(report.restored, 0);
        assert!(fixture.queue.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_while_away_is_finalized() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Downloading).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Completed {
                location: PathBuf::from("/tmp/spool/f.bin"),
            },
            bytes_downloaded: 1024,
            total_bytes: Some(1024),
        }]);

        let report = reconcile(&fixture).await;

        assert_eq!(report.completed, vec![(id, PathBuf::from("/tmp/spool/f.bin"))]);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(task.bytes_downloaded, 1024);
    }

    #[tokio::test]
    async fn test_completed_while_away_despite_paused_intent() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Paused).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Completed {
                location: PathBuf::from("/tmp/spool/f.bin"),
            },
            bytes_downloaded: 100,
            total_bytes: Some(100),
        }]);

        let report = reconcile(&fixture).await;

        // Native completion wins over the persisted pause.
        assert_eq!(report.completed.len(), 1);
        assert_eq!(
            fixture.queue.get(id).await.unwrap().status,
            DownloadStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_completed_while_away_despite_failed_intent() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Failed).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Completed {
                location: PathBuf::from("/tmp/spool/f.bin"),
            },
            bytes_downloaded: 2048,
            total_bytes: Some(2048),
        }]);

        let report = reconcile(&fixture).await;

        // The payload landed; the persisted failure is superseded.
        assert_eq!(report.completed, vec![(id, PathBuf::from("/tmp/spool/f.bin"))]);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(task.bytes_downloaded, 2048);
        assert!(task.last_error.is_none());
    }

    #[tokio::test]
    async fn test_still_active_transfer_despite_failed_intent_reattaches() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Failed).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Active,
            bytes_downloaded: 256,
            total_bytes: Some(1024),
        }]);

        let report = reconcile(&fixture).await;

        assert_eq!(report.reattached, 1);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(task.bytes_downloaded, 256);
    }

    #[tokio::test]
    async fn test_still_active_transfer_is_reattached() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Downloading).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Active,
            bytes_downloaded: 512,
            total_bytes: Some(2048),
        }]);

        let report = reconcile(&fixture).await;

        assert_eq!(report.reattached, 1);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(task.bytes_downloaded, 512);
        assert_eq!(fixture.queue.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_while_away_records_error() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Downloading).await;
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: id,
            status: NativeTransferStatus::Failed {
                error: "connection reset by peer".to_string(),
            },
            bytes_downloaded: 0,
            total_bytes: None,
        }]);

        let report = reconcile(&fixture).await;

        assert_eq!(report.failed, 1);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("connection reset by peer"));
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_unreported_downloading_with_resume_data_pauses() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Downloading).await;
        fixture.resume_store.save(id, b"continuation").await.unwrap();

        let report = reconcile(&fixture).await;

        assert_eq!(report.demoted_paused, 1);
        assert_eq!(
            fixture.queue.get(id).await.unwrap().status,
            DownloadStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_unreported_downloading_without_resume_data_requeues() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Downloading).await;

        let report = reconcile(&fixture).await;

        assert_eq!(report.demoted_pending, 1);
        let task = fixture.queue.get(id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Pending);
        // The transfer dying with the process is not the task's fault.
        assert_eq!(task.retry_count, 0);
        assert_eq!(fixture.queue.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_native_transfer_for_unknown_task_is_aborted() {
        let fixture = fixture();
        let ghost = Uuid::new_v4();
        fixture.port.set_pending_transfers(vec![PendingTransfer {
            task_id: ghost,
            status: NativeTransferStatus::Active,
            bytes_downloaded: 10,
            total_bytes: None,
        }]);

        reconcile(&fixture).await;

        assert_eq!(fixture.port.cancelled(), vec![(ghost, false)]);
        assert!(fixture.queue.get(ghost).await.is_none());
    }

    #[tokio::test]
    async fn test_orphaned_resume_blobs_are_removed() {
        let fixture = fixture();
        let id = persist_one(&fixture, DownloadStatus::Paused).await;
        fixture.resume_store.save(id, b"keep").await.unwrap();
        let orphan = Uuid::new_v4();
        fixture.resume_store.save(orphan, b"orphan").await.unwrap();

        let report = reconcile(&fixture).await;

        assert_eq!(report.orphans_removed, 1);
        assert!(fixture.resume_store.has_resume_data(id));
        assert!(!fixture.resume_store.has_resume_data(orphan));
    }
}
