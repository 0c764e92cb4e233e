//! Error types for the backup manager.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Another run is active (pid {pid}, lock age {age_secs}s)")]
    LockContention { pid: u32, age_secs: u64 },

    #[error("{program} failed (exit code {}): {output}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Subprocess {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extracting into {} failed, previous tree kept at {}: {source}", .target.display(), .safety.display())]
    Extraction {
        target: PathBuf,
        safety: PathBuf,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Attach a path to an I/O error.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Extension for tagging I/O results with the path they touched.
pub trait IoResultExt<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| BackupError::fs(path, e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprocess_message_includes_code_and_output() {
        let err = BackupError::Subprocess {
            program: "mysqldump".to_string(),
            code: Some(2),
            output: "Access denied".to_string(),
        };
        assert_eq!(err.to_string(), "mysqldump failed (exit code 2): Access denied");

        let err = BackupError::Subprocess {
            program: "mysql".to_string(),
            code: None,
            output: "killed".to_string(),
        };
        assert!(err.to_string().contains("exit code none"));
    }

    #[test]
    fn test_filesystem_error_names_path() {
        let err = std::io::Result::<()>::Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .at(std::path::Path::new("/backups/2026-01-01"))
            .unwrap_err();
        assert!(err.to_string().contains("/backups/2026-01-01"));
    }
}
