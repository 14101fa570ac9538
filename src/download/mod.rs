pub mod error;
pub mod events;
pub mod fake_transfer;
pub mod history;
pub mod http_transfer;
pub mod manager;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod resume_store;
pub mod scheduler;
pub mod task;
pub mod transfer;
