//! Terminal-outcome history
//!
//! Bounded, append-only log of finished tasks for diagnostics. Insertion
//! past the cap evicts the oldest entry, ring-buffer style.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::task::DownloadTask;

/// Immutable record of one terminal task outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: Uuid,
    pub url: String,
    pub category: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_downloaded: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl HistoryEntry {
    pub fn from_task(task: &DownloadTask, success: bool) -> Self {
        Self {
            task_id: task.id,
            url: task.source_url.clone(),
            category: task.category.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
            bytes_downloaded: task.bytes_downloaded,
            success,
            error_message: task.last_error.clone(),
        }
    }
}

/// TOML serialization wrapper (TOML requires a root table).
#[derive(Serialize, Deserialize)]
struct HistoryFile {
    entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Most recent entries first, at most `limit`.
    pub fn get_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear_history(&mut self) {
        self.entries.clear();
    }

    /// JSON export for diagnostics and support bundles.
    pub fn export_json(&self) -> anyhow::Result<String> {
        let entries: Vec<&HistoryEntry> = self.entries.iter().collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Loads history from a TOML file, trimming to the cap.
    pub fn load<P: AsRef<Path>>(path: P, cap: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(cap));
        }
        let content = fs::read_to_string(path)?;
        let file: HistoryFile = toml::from_str(&content)?;
        let mut history = Self::new(cap);
        for entry in file.entries {
            history.record(entry);
        }
        Ok(history)
    }

    /// Saves history to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let file = HistoryFile {
            entries: self.entries.iter().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(success: bool) -> HistoryEntry {
        let task = DownloadTask::new("https://example.com/file.bin", "datasets");
        HistoryEntry::from_task(&task, success)
    }

    #[test]
    fn test_record_and_read() {
        let mut history = History::new(10);
        assert!(history.is_empty());

        history.record(entry(true));
        history.record(entry(false));

        assert_eq!(history.len(), 2);
        let recent = history.get_history(10);
        // Most recent first.
        assert!(!recent[0].success);
        assert!(recent[1].success);
    }

    #[test]
    fn test_bounded_read() {
        let mut history = History::new(10);
        for _ in 0..5 {
            history.record(entry(true));
        }
        assert_eq!(history.get_history(3).len(), 3);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut history = History::new(3);
        let mut first = entry(true);
        first.url = "https://example.com/oldest".to_string();
        history.record(first);
        for _ in 0..3 {
            history.record(entry(true));
        }

        assert_eq!(history.len(), 3);
        assert!(history
            .get_history(3)
            .iter()
            .all(|e| e.url != "https://example.com/oldest"));
    }

    #[test]
    fn test_never_exceeds_cap() {
        let mut history = History::new(1000);
        for _ in 0..2500 {
            history.record(entry(true));
        }
        assert_eq!(history.len(), 1000);
    }

    #[test]
    fn test_clear() {
        let mut history = History::new(10);
        history.record(entry(true));
        history.clear_history();
        assert!(history.is_empty());
    }

    #[test]
    fn test_export_json() {
        let mut history = History::new(10);
        history.record(entry(true));
        let json = history.export_json().unwrap();
        assert!(json.contains("https://example.com/file.bin"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("history.toml");

        let mut history = History::new(10);
        history.record(entry(true));
        history.record(entry(false));
        history.save(&path).unwrap();

        let loaded = History::load(&path, 10).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let history = History::load(temp_dir.path().join("none.toml"), 10).unwrap();
        assert!(history.is_empty());
    }
}
