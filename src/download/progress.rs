//! Per-task and aggregate transfer progress
//!
//! Rates are smoothed with an exponential moving average over recent
//! updates; a raw instantaneous delta is too jittery to display or to
//! derive a stable ETA from.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Smoothing factor for the per-task rate EMA.
const RATE_ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
struct TaskProgress {
    bytes: u64,
    total: Option<u64>,
    last_update: Instant,
    rate_bps: f64,
}

/// Aggregate view derived from a consistent set of task states.
#[derive(Debug, Clone, Default)]
pub struct ProgressSummary {
    /// Completed bytes plus bytes of all in-flight tasks.
    pub total_downloaded: u64,
    /// Expected bytes across tasks whose total is known.
    pub total_expected: u64,
    /// Overall fraction; None when no task has a known total yet.
    pub fraction: Option<f64>,
    /// Smoothed combined rate in bytes per second.
    pub rate_bps: f64,
    /// Remaining known bytes divided by the smoothed rate.
    pub eta: Option<Duration>,
}

#[derive(Default)]
pub struct ProgressAggregator {
    active: HashMap<Uuid, TaskProgress>,
    /// Bytes of tasks that finished; kept in cumulative totals.
    completed_bytes: u64,
    completed_expected: u64,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress update for an active task.
    pub fn update(&mut self, task_id: Uuid, bytes: u64, total: Option<u64>) {
        let now = Instant::now();
        match self.active.get_mut(&task_id) {
            Some(progress) => {
                let elapsed = now.duration_since(progress.last_update).as_secs_f64();
                if elapsed > 0.0 {
                    let delta = bytes.saturating_sub(progress.bytes) as f64;
                    let instantaneous = delta / elapsed;
                    progress.rate_bps =
                        RATE_ALPHA * instantaneous + (1.0 - RATE_ALPHA) * progress.rate_bps;
                    progress.last_update = now;
                }
                progress.bytes = bytes;
                if total.is_some() {
                    progress.total = total;
                }
            }
            None => {
                self.active.insert(
                    task_id,
                    TaskProgress {
                        bytes,
                        total,
                        last_update: now,
                        rate_bps: 0.0,
                    },
                );
            }
        }
    }

    /// Fold a finished task's bytes into the cumulative totals and drop
    /// it from the active rate computation.
    pub fn task_completed(&mut self, task_id: Uuid) {
        if let Some(progress) = self.active.remove(&task_id) {
            let final_bytes = progress.total.unwrap_or(progress.bytes);
            self.completed_bytes += final_bytes;
            self.completed_expected += progress.total.unwrap_or(final_bytes);
        }
    }

    /// Drop a failed or cancelled task from the active computation.
    pub fn task_failed(&mut self, task_id: Uuid) {
        self.active.remove(&task_id);
    }

    pub fn summary(&self) -> ProgressSummary {
        let mut downloaded = self.completed_bytes;
        let mut expected = self.completed_expected;
        let mut known_downloaded = self.completed_bytes;
        let mut remaining_known: u64 = 0;
        let mut rate = 0.0;

        for progress in self.active.values() {
            downloaded += progress.bytes;
            rate += progress.rate_bps;
            // Unknown-total tasks stay out of the fraction until the
            // transfer reports a size.
            if let Some(total) = progress.total {
                expected += total;
                known_downloaded += progress.bytes;
                remaining_known += total.saturating_sub(progress.bytes);
            }
        }

        let fraction = if expected > 0 {
            Some(known_downloaded as f64 / expected as f64)
        } else {
            None
        };
        let eta = if rate > 0.0 && remaining_known > 0 {
            Some(Duration::from_secs_f64(remaining_known as f64 / rate))
        } else {
            None
        };

        ProgressSummary {
            total_downloaded: downloaded,
            total_expected: expected,
            fraction,
            rate_bps: rate,
            eta,
        }
    }
}
