//! Deterministic in-memory transfer adapter
//!
//! Simulates progress, failure, disconnection, and transfers that
//! survived a relaunch, without any network. Tests script the native
//! layer's behavior explicitly and observe what the core does with it.

use super::error::DownloadError;
use super::transfer::{PendingTransfer, TransferEvent, TransferPort};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    started: Vec<(Uuid, String, Option<Vec<u8>>)>,
    cancelled: Vec<(Uuid, bool)>,
    active: HashSet<Uuid>,
    /// Blob handed back when a transfer is cancelled with resume capture.
    resume_payloads: HashMap<Uuid, Vec<u8>>,
    /// Tasks whose start() call should be rejected outright.
    fail_on_start: HashMap<Uuid, String>,
    /// What enumerate_pending_transfers reports (relaunch survivors).
    pending: Vec<PendingTransfer>,
}

pub struct FakeTransferPort {
    events: mpsc::Sender<TransferEvent>,
    state: Mutex<FakeState>,
}

impl FakeTransferPort {
    pub fn new(events: mpsc::Sender<TransferEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    // ---- test scripting ----

    pub fn set_resume_payload(&self, task_id: Uuid, payload: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .resume_payloads
            .insert(task_id, payload);
    }

    pub fn fail_start(&self, task_id: Uuid, error: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .fail_on_start
            .insert(task_id, error.into());
    }

    /// Script what the native layer still knows about after a relaunch.
    pub fn set_pending_transfers(&self, pending: Vec<PendingTransfer>) {
        self.state.lock().unwrap().pending = pending;
    }

    pub fn started_ids(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .unwrap()
            .started
            .iter()
            .map(|(id, _, _)| *id)
            .collect()
    }

    pub fn started_with_resume(&self, task_id: Uuid) -> bool {
        self.state
            .lock()
            .unwrap()
            .started
            .iter()
            .any(|(id, _, resume)| *id == task_id && resume.is_some())
    }

    pub fn cancelled(&self) -> Vec<(Uuid, bool)> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn is_active(&self, task_id: Uuid) -> bool {
        self.state.lock().unwrap().active.contains(&task_id)
    }

    // ---- scripted event delivery ----

    pub async fn emit_progress(&self, task_id: Uuid, bytes: u64, total: Option<u64>) {
        let _ = self
            .events
            .send(TransferEvent::Progress {
                task_id,
                bytes_downloaded: bytes,
                total_bytes: total,
            })
            .await;
    }

    pub async fn complete(&self, task_id: Uuid, temp_location: PathBuf) {
        self.state.lock().unwrap().active.remove(&task_id);
        let _ = self
            .events
            .send(TransferEvent::Finished {
                task_id,
                temp_location,
            })
            .await;
    }

    pub async fn fail(&self, task_id: Uuid, error: DownloadError, resume_data: Option<Vec<u8>>) {
        self.state.lock().unwrap().active.remove(&task_id);
        let _ = self
            .events
            .send(TransferEvent::Failed {
                task_id,
                error,
                resume_data,
            })
            .await;
    }

    pub async fn drain_done(&self) {
        let _ = self.events.send(TransferEvent::AllEventsDelivered).await;
    }
}

#[async_trait]
impl TransferPort for FakeTransferPort {
    async fn start(
        &self,
        task_id: Uuid,
        url: &str,
        resume_data: Option<Vec<u8>>,
    ) -> Result<(), DownloadError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_on_start.get(&task_id) {
            return Err(DownloadError::Transfer(error.clone()));
        }
        state.started.push((task_id, url.to_string(), resume_data));
        state.active.insert(task_id);
        Ok(())
    }

    async fn cancel(&self, task_id: Uuid, produce_resume_data: bool) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push((task_id, produce_resume_data));
        state.active.remove(&task_id);
        if produce_resume_data {
            state.resume_payloads.get(&task_id).cloned()
        } else {
            None
        }
    }

    async fn enumerate_pending_transfers(&self) -> Vec<PendingTransfer> {
        self.state.lock().unwrap().pending.clone()
    }
}
