//! HTTP transfer adapter
//!
//! Streams each transfer into a spool file with reqwest, reporting
//! progress through the shared event channel. Resume data is a small
//! JSON record naming the spool offset; it is opaque to the core, which
//! only stores and returns it.

use super::error::DownloadError;
use super::transfer::{NativeTransferStatus, PendingTransfer, TransferEvent, TransferPort};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RANGE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Continuation state serialized into the resume blob.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    offset: u64,
}

struct ActiveTransfer {
    handle: JoinHandle<()>,
    bytes: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    spool_path: PathBuf,
}

type ActiveMap = Arc<Mutex<HashMap<Uuid, ActiveTransfer>>>;

pub struct HttpTransferPort {
    client: reqwest::Client,
    spool_dir: PathBuf,
    events: mpsc::Sender<TransferEvent>,
    active: ActiveMap,
}

impl HttpTransferPort {
    pub fn new(spool_dir: PathBuf, events: mpsc::Sender<TransferEvent>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            client,
            spool_dir,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn spool_path(&self, task_id: Uuid) -> PathBuf {
        self.spool_dir.join(format!("{}.part", task_id))
    }

    async fn run_transfer(
        client: reqwest::Client,
        url: String,
        spool_path: PathBuf,
        resume_from: u64,
        bytes: Arc<AtomicU64>,
        total: Arc<AtomicU64>,
        events: mpsc::Sender<TransferEvent>,
        task_id: Uuid,
    ) -> Result<(), DownloadError> {
        let mut request = client.get(&url);
        let mut actual_resume_from = resume_from;
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }

        let mut response = request.send().await?;

        // Server dropped our range; restart from scratch.
        if response.status().as_u16() == 416 && resume_from > 0 {
            tracing::warn!("Got 416 for task {}, restarting without Range", task_id);
            actual_resume_from = 0;
            response = client.get(&url).send().await?;
        }

        if !response.status().is_success() {
            return Err(DownloadError::Transfer(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let total_bytes = response
            .content_length()
            .map(|len| len + actual_resume_from);
        if let Some(expected) = total_bytes {
            total.store(expected, Ordering::Relaxed);
        }

        let file = if actual_resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&spool_path)
                .await?
        } else {
            tokio::fs::File::create(&spool_path).await?
        };
        let mut writer = tokio::io::BufWriter::new(file);

        let mut downloaded = actual_resume_from;
        let mut last_report = tokio::time::Instant::now();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            bytes.store(downloaded, Ordering::Relaxed);

            // Throttle progress events to at most one per 500ms.
            if last_report.elapsed() >= Duration::from_millis(500) {
                last_report = tokio::time::Instant::now();
                let _ = events
                    .send(TransferEvent::Progress {
                        task_id,
                        bytes_downloaded: downloaded,
                        total_bytes,
                    })
                    .await;
            }
        }
        writer.flush().await?;

        let _ = events
            .send(TransferEvent::Progress {
                task_id,
                bytes_downloaded: downloaded,
                total_bytes,
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl TransferPort for HttpTransferPort {
    async fn start(
        &self,
        task_id: Uuid,
        url: &str,
        resume_data: Option<Vec<u8>>,
    ) -> Result<(), DownloadError> {
        url::Url::parse(url)
            .map_err(|e| DownloadError::Transfer(format!("invalid url {}: {}", url, e)))?;
        tokio::fs::create_dir_all(&self.spool_dir).await?;

        let spool_path = self.spool_path(task_id);
        let resume_from = match resume_data {
            Some(blob) => match serde_json::from_slice::<ResumeState>(&blob) {
                // Only trust the offset if the spool file still covers it.
                Ok(state) => match tokio::fs::metadata(&spool_path).await {
                    Ok(meta) if meta.len() >= state.offset => state.offset,
                    _ => 0,
                },
                Err(e) => {
                    tracing::warn!("Discarding unreadable resume blob for {}: {}", task_id, e);
                    0
                }
            },
            None => 0,
        };

        let bytes = Arc::new(AtomicU64::new(resume_from));
        let total = Arc::new(AtomicU64::new(0));
        let client = self.client.clone();
        let events = self.events.clone();
        let active = Arc::clone(&self.active);
        let url_owned = url.to_string();
        let spool_for_task = spool_path.clone();
        let bytes_for_task = Arc::clone(&bytes);
        let total_for_task = Arc::clone(&total);

        let handle = tokio::spawn(async move {
            let result = Self::run_transfer(
                client,
                url_owned,
                spool_for_task.clone(),
                resume_from,
                Arc::clone(&bytes_for_task),
                total_for_task,
                events.clone(),
                task_id,
            )
            .await;

            active.lock().unwrap().remove(&task_id);
            match result {
                Ok(()) => {
                    let _ = events
                        .send(TransferEvent::Finished {
                            task_id,
                            temp_location: spool_for_task,
                        })
                        .await;
                }
                Err(error) => {
                    let offset = bytes_for_task.load(Ordering::Relaxed);
                    let resume_data = if offset > 0 {
                        serde_json::to_vec(&ResumeState { offset }).ok()
                    } else {
                        None
                    };
                    let _ = events
                        .send(TransferEvent::Failed {
                            task_id,
                            error,
                            resume_data,
                        })
                        .await;
                }
            }
        });

        let mut active = self.active.lock().unwrap();
        active.insert(
            task_id,
            ActiveTransfer {
                handle,
                bytes,
                total,
                spool_path,
            },
        );
        // The spawned task removes its own entry on exit; if it beat us
        // here, drop the stale record instead of reporting it forever.
        if active
            .get(&task_id)
            .is_some_and(|entry| entry.handle.is_finished())
        {
            active.remove(&task_id);
        }
        Ok(())
    }

    async fn cancel(&self, task_id: Uuid, produce_resume_data: bool) -> Option<Vec<u8>> {
        let entry = self.active.lock().unwrap().remove(&task_id)?;
        entry.handle.abort();
        let offset = entry.bytes.load(Ordering::Relaxed);

        if produce_resume_data && offset > 0 {
            serde_json::to_vec(&ResumeState { offset }).ok()
        } else {
            // Nothing to resume from; drop the spool file.
            let _ = tokio::fs::remove_file(&entry.spool_path).await;
            None
        }
    }

    /// This adapter lives in-process, so nothing survives a relaunch;
    /// only currently-running transfers are reported.
    async fn enumerate_pending_transfers(&self) -> Vec<PendingTransfer> {
        let active = self.active.lock().unwrap();
        active
            .iter()
            .map(|(id, transfer)| {
                let total = transfer.total.load(Ordering::Relaxed);
                PendingTransfer {
                    task_id: *id,
                    status: NativeTransferStatus::Active,
                    bytes_downloaded: transfer.bytes.load(Ordering::Relaxed),
                    total_bytes: (total > 0).then_some(total),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_download_completes_and_spools() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let temp_dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let port = HttpTransferPort::new(temp_dir.path().join("spool"), tx).unwrap();
        let id = Uuid::new_v4();

        port.start(id, &format!("{}/file.bin", server.uri()), None)
            .await
            .unwrap();

        // Drain events until the transfer finishes.
        let location = loop {
            match rx.recv().await.unwrap() {
                TransferEvent::Finished { task_id, temp_location } => {
                    assert_eq!(task_id, id);
                    break temp_location;
                }
                TransferEvent::Progress { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        };
        assert_eq!(tokio::fs::metadata(&location).await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_http_error_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.bin"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let temp_dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let port = HttpTransferPort::new(temp_dir.path().join("spool"), tx).unwrap();
        let id = Uuid::new_v4();

        port.start(id, &format!("{}/gone.bin", server.uri()), None)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            TransferEvent::Failed { task_id, error, .. } => {
                assert_eq!(task_id, id);
                assert!(error.to_string().contains("404"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_synchronously() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let port = HttpTransferPort::new(temp_dir.path().join("spool"), tx).unwrap();

        let result = port.start(Uuid::new_v4(), "not a url", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stale_resume_blob_restarts_from_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 128]))
            .mount(&server)
            .await;

        let temp_dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let port = HttpTransferPort::new(temp_dir.path().join("spool"), tx).unwrap();
        let id = Uuid::new_v4();

        // Resume blob claims an offset but no spool file exists.
        let blob = serde_json::to_vec(&ResumeState { offset: 64 }).unwrap();
        port.start(id, &format!("{}/file.bin", server.uri()), Some(blob))
            .await
            .unwrap();

        let location = loop {
            if let TransferEvent::Finished { temp_location, .. } = rx.recv().await.unwrap() {
                break temp_location;
            }
        };
        assert_eq!(tokio::fs::metadata(&location).await.unwrap().len(), 128);
    }
}
