mod common;

use common::*;
use longhaul::config::QueueConfig;
use longhaul::download::queue::TaskQueue;
use longhaul::download::scheduler::UnboundedStorage;
use longhaul::download::task::{DownloadStatus, DownloadTask};
use longhaul::download::transfer::{NativeTransferStatus, PendingTransfer};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Write a snapshot for one task in the given state, as a previous
/// process generation would have left it.
async fn persist_task(data_dir: &std::path::Path, status: DownloadStatus) -> Uuid {
    let staging = TaskQueue::new();
    let mut task = DownloadTask::new("https://example.com/archive.tar.gz", "datasets");
    task.status = status;
    task.bytes_downloaded = 512;
    task.total_bytes = Some(2048);
    let id = task.id;
    staging.add(task).await;
    test_persistence(data_dir)
        .save(&staging.snapshot().await)
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_relaunch_restores_persisted_tasks() {
    let data_dir = tempfile::tempdir().unwrap();

    let first = deploy(data_dir.path()).await;
    let a = first
        .manager
        .add_download("https://example.com/a.bin", "datasets")
        .await;
    let b = first
        .manager
        .add_download("https://example.com/b.bin", "models")
        .await;
    first.port.emit_progress(a, 100, Some(400)).await;
    settle().await;
    first.manager.flush().await.unwrap();
    drop(first);

    let second = deploy(data_dir.path()).await;
    assert_eq!(second.report.restored, 2);
    let restored_a = second.manager.get_task(a).await.unwrap();
    assert_eq!(restored_a.bytes_downloaded, 100);
    assert_eq!(restored_a.total_bytes, Some(400));
    assert_eq!(restored_a.category, "datasets");
    assert!(second.manager.get_task(b).await.is_some());
}

#[tokio::test]
async fn test_completed_while_away_fires_hook_exactly_once() {
    let data_dir = tempfile::tempdir().unwrap();
    let id = persist_task(data_dir.path(), DownloadStatus::Downloading).await;

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let port = Arc::new(longhaul::download::fake_transfer::FakeTransferPort::new(tx));
    port.set_pending_transfers(vec![PendingTransfer {
        task_id: id,
        status: NativeTransferStatus::Completed {
            location: PathBuf::from("/tmp/spool/archive.tar.gz"),
        },
        bytes_downloaded: 2048,
        total_bytes: Some(2048),
    }]);

    let config = QueueConfig::default();
    let manager = longhaul::download::manager::DownloadManager::new(
        config.clone(),
        longhaul::download::scheduler::Scheduler::new(config, Box::new(UnboundedStorage)),
        test_persistence(data_dir.path()),
        Arc::new(test_resume_store(data_dir.path())),
        port.clone(),
        None,
    );
    let completions: Arc<Mutex<Vec<Uuid>>> = Arc::default();
    let sink = Arc::clone(&completions);
    manager.set_completion_hook(Arc::new(move |id, _location| {
        sink.lock().unwrap().push(id);
    }));

    Arc::clone(&manager).launch(rx).await.unwrap();
    settle().await;

    let task = manager.get_task(id).await.unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
    assert_eq!(task.bytes_downloaded, 2048);
    assert_eq!(completions.lock().unwrap().as_slice(), &[id]);
}

#[tokio::test]
async fn test_interrupted_download_without_resume_data_restarts() {
    let data_dir = tempfile::tempdir().unwrap();
    let id = persist_task(data_dir.path(), DownloadStatus::Downloading).await;

    let deployment = deploy(data_dir.path()).await;
    assert_eq!(deployment.report.demoted_pending, 1);

    // Demoted to pending, then re-admitted by the launch pass.
    let task = deployment.manager.get_task(id).await.unwrap();
    assert_eq!(task.status, DownloadStatus::Downloading);
    assert_eq!(task.retry_count, 0);
    assert!(!deployment.port.started_with_resume(id));
}

#[tokio::test]
async fn test_interrupted_download_with_resume_data_pauses() {
    let data_dir = tempfile::tempdir().unwrap();
    let id = persist_task(data_dir.path(), DownloadStatus::Downloading).await;
    test_resume_store(data_dir.path())
        .save(id, b"continuation")
        .await
        .unwrap();

    let deployment = deploy(data_dir.path()).await;
    assert_eq!(deployment.report.demoted_paused, 1);
    assert_eq!(
        deployment.manager.get_task(id).await.unwrap().status,
        DownloadStatus::Paused
    );

    // An explicit resume reuses the captured continuation.
    deployment.manager.resume_task(id).await;
    assert!(deployment.port.started_with_resume(id));
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let data_dir = tempfile::tempdir().unwrap();
    tokio::fs::write(data_dir.path().join("queue.json"), "{ definitely not json")
        .await
        .unwrap();

    let deployment = deploy(data_dir.path()).await;
    assert_eq!(deployment.report.restored, 0);
    assert!(deployment.manager.all_tasks().await.is_empty());

    // The queue is fully operational after the degraded start.
    let id = deployment
        .manager
        .add_download("https://example.com/a.bin", "datasets")
        .await;
    assert!(deployment.manager.get_task(id).await.is_some());
}

#[tokio::test]
async fn test_interrupted_snapshot_write_keeps_prior_state() {
    let data_dir = tempfile::tempdir().unwrap();
    let id = persist_task(data_dir.path(), DownloadStatus::Paused).await;

    // A crash mid-write leaves garbage in the temp file only.
    tokio::fs::write(data_dir.path().join("queue.json.tmp"), "garbage")
        .await
        .unwrap();

    let deployment = deploy(data_dir.path()).await;
    assert_eq!(deployment.report.restored, 1);
    assert_eq!(
        deployment.manager.get_task(id).await.unwrap().status,
        DownloadStatus::Paused
    );
}

#[tokio::test]
async fn test_completed_status_survives_relaunch_with_byte_counts() {
    let data_dir = tempfile::tempdir().unwrap();

    let first = deploy(data_dir.path()).await;
    let id = first
        .manager
        .add_download("https://example.com/a.bin", "datasets")
        .await;
    first.port.emit_progress(id, 4096, Some(4096)).await;
    first.port.complete(id, PathBuf::from("/tmp/a.bin")).await;
    settle().await;
    first.manager.flush().await.unwrap();
    drop(first);

    let second = deploy(data_dir.path()).await;
    let task = second.manager.get_task(id).await.unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
    assert_eq!(task.bytes_downloaded, 4096);
    assert_eq!(task.total_bytes, Some(4096));
    // Already terminal; reconciliation must not touch it.
    assert!(second.report.completed.is_empty());
    assert!(second.port.started_ids().is_empty());
}
