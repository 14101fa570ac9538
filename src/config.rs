use serde::{Deserialize, Serialize};
use std::path::Path;

/// Queue-wide tunables (saved to config/queue.toml).
///
/// Every policy constant the scheduler and persistence layers rely on is
/// exposed here rather than hard-coded, so deployments can tune retry
/// pacing, storage headroom, and snapshot cadence without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Hard ceiling on tasks in `downloading` at any instant.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
    /// Automatic retries allowed per task before it is left failed.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Base delay for linear retry backoff: `base * retry_count` seconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    /// Free-space margin that must remain after admitting a task.
    #[serde(default = "default_storage_margin")]
    pub storage_margin_bytes: u64,
    /// Coalescing window for debounced snapshot saves.
    #[serde(default = "default_save_debounce")]
    pub save_debounce_ms: u64,
    /// Upper bound on how long a dirty queue may go unsaved.
    #[serde(default = "default_save_max_delay")]
    pub save_max_delay_ms: u64,
    /// Maximum entries retained in the terminal-outcome history.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Scheduler tick interval (drives backoff expiry re-checks).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_storage_margin() -> u64 {
    500 * 1024 * 1024
}

fn default_save_debounce() -> u64 {
    2_000
}

fn default_save_max_delay() -> u64 {
    10_000
}

fn default_history_cap() -> usize {
    1_000
}

fn default_tick_interval() -> u64 {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent(),
            retry_ceiling: default_retry_ceiling(),
            retry_backoff_secs: default_retry_backoff(),
            storage_margin_bytes: default_storage_margin(),
            save_debounce_ms: default_save_debounce(),
            save_max_delay_ms: default_save_max_delay(),
            history_cap: default_history_cap(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl QueueConfig {
    /// Loads config from a TOML file, falling back to defaults when the
    /// file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: QueueConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves config as pretty-printed TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
