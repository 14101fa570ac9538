pub mod config;
pub mod download;
pub mod util;

pub use config::QueueConfig;
pub use download::manager::DownloadManager;
pub use download::task::{DownloadStatus, DownloadTask};
