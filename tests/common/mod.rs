use longhaul::config::QueueConfig;
use longhaul::download::fake_transfer::FakeTransferPort;
use longhaul::download::manager::DownloadManager;
use longhaul::download::persistence::StatePersistence;
use longhaul::download::reconcile::ReconcileReport;
use longhaul::download::resume_store::ResumeDataStore;
use longhaul::download::scheduler::{Scheduler, StorageProbe, UnboundedStorage};
use longhaul::download::task::DownloadStatus;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// One launched manager generation over a data directory. Dropping it
/// and deploying again over the same directory simulates a relaunch.
pub struct Deployment {
    pub manager: Arc<DownloadManager>,
    pub port: Arc<FakeTransferPort>,
    pub report: ReconcileReport,
}

/// Persistence with short debounce windows so tests settle quickly.
pub fn test_persistence(data_dir: &Path) -> StatePersistence {
    StatePersistence::new(
        data_dir.join("queue.json"),
        Duration::from_millis(20),
        Duration::from_millis(100),
    )
}

pub fn test_resume_store(data_dir: &Path) -> ResumeDataStore {
    ResumeDataStore::new(data_dir.join("resume"))
}

/// Build and launch a manager over `data_dir`. `script` runs against
/// the fake transfer port before launch, so tests can stage what the
/// native layer remembers from before the "relaunch".
pub async fn deploy_scripted(
    data_dir: &Path,
    config: QueueConfig,
    storage: Box<dyn StorageProbe>,
    script: impl FnOnce(&FakeTransferPort),
) -> Deployment {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let (tx, rx) = mpsc::channel(64);
    let port = Arc::new(FakeTransferPort::new(tx));
    script(&port);

    let scheduler = Scheduler::new(config.clone(), storage);
    let manager = DownloadManager::new(
        config,
        scheduler,
        test_persistence(data_dir),
        Arc::new(test_resume_store(data_dir)),
        port.clone(),
        Some(data_dir.join("history.toml")),
    );
    let report = Arc::clone(&manager)
        .launch(rx)
        .await
        .expect("manager launch");
    Deployment {
        manager,
        port,
        report,
    }
}

pub async fn deploy(data_dir: &Path) -> Deployment {
    deploy_scripted(
        data_dir,
        QueueConfig::default(),
        Box::new(UnboundedStorage),
        |_| {},
    )
    .await
}

/// Let the manager's event loop drain whatever is in flight.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(40)).await;
}

#[allow(dead_code)]
pub async fn wait_for_status(
    manager: &DownloadManager,
    task_id: uuid::Uuid,
    expected: DownloadStatus,
    timeout_ms: u64,
) -> Result<(), String> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            if let Some(task) = manager.get_task(task_id).await {
                if task.status == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| format!("Timeout waiting for status {:?}", expected))
}
