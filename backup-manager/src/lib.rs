//! Backup Manager Library
//!
//! Locked, scheduled backups of a MySQL database and an upload tree, with
//! post-creation verification, per-run manifests, retention and restore.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod database;
pub mod executor;
pub mod fs;
pub mod process;
pub mod report;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupExecutor, BackupOptions, RunOutcome};
pub use restore::{RestoreOrchestrator, RestoreRequest};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
