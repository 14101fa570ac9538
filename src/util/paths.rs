use anyhow::{Context, Result};
use std::path::PathBuf;

/// Find the data directory by searching in priority order:
/// 1. Environment variable LONGHAUL_DATA_DIR (tests and overrides)
/// 2. Platform data directory (`~/.local/share/longhaul` on Unix,
///    `%APPDATA%\longhaul` on Windows)
///
/// Creates the directory if it does not exist yet.
pub fn find_data_directory() -> Result<PathBuf> {
    if let Ok(env_path) = std::env::var("LONGHAUL_DATA_DIR") {
        let env_dir = PathBuf::from(env_path);
        std::fs::create_dir_all(&env_dir)
            .context("Failed to create data directory from LONGHAUL_DATA_DIR")?;
        tracing::debug!("Using data directory from LONGHAUL_DATA_DIR: {:?}", env_dir);
        return Ok(env_dir);
    }

    let base_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine user data directory"))?;
    let data_dir = base_dir.join("longhaul");
    std::fs::create_dir_all(&data_dir).context("Failed to create user data directory")?;
    Ok(data_dir)
}

/// Absolute path of the queue snapshot file.
pub fn get_snapshot_path() -> Result<PathBuf> {
    Ok(find_data_directory()?.join("queue.json"))
}

/// Directory holding one resume blob per task id.
pub fn get_resume_dir() -> Result<PathBuf> {
    Ok(find_data_directory()?.join("resume"))
}

/// Absolute path of the terminal-outcome history file.
pub fn get_history_path() -> Result<PathBuf> {
    Ok(find_data_directory()?.join("history.toml"))
}

/// Directory where in-flight transfers spool bytes before completion.
pub fn get_spool_dir() -> Result<PathBuf> {
    Ok(find_data_directory()?.join("spool"))
}
