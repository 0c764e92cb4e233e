//! Run manifest types and persistence.
//!
//! A manifest is written as `manifest.json` in each run directory. The
//! `metadata` block is always present; `database` and `files` appear only when
//! that phase produced an artifact.

use crate::utils::errors::{BackupError, IoResultExt, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Database only
    Daily,
    /// Database and upload tree
    Full,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Daily => write!(f, "daily"),
            RunType::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub metadata: RunMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Local wall-clock start, `YYYY-MM-DD HH:MM:SS`
    pub date: String,
    /// Run identifier, also the run directory name
    pub timestamp: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    /// Seconds
    pub duration: f64,
    pub total_size: u64,
    pub server: HostInfo,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub tool_version: String,
}

impl HostInfo {
    pub fn current() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseArtifact {
    /// File name inside the run's `database/` directory
    pub file: String,
    pub size: u64,
    pub checksum: String,
    #[serde(default)]
    pub tables: Vec<TableStats>,
    /// Sum of per-table row counts
    pub rows: u64,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub name: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// File name inside the run's `files/` directory
    pub file: String,
    pub size: u64,
    pub checksum: String,
    pub count: usize,
    pub original_size: u64,
    pub compression_ratio: f64,
    /// Entries left out because their names are not valid UTF-8
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

/// Collects phase results for one run and produces its manifest.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    run_id: String,
    started_at: DateTime<Local>,
    run_type: RunType,
    host: HostInfo,
    database: Option<DatabaseArtifact>,
    files: Option<FileArtifact>,
}

impl ManifestBuilder {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Local>, run_type: RunType) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            run_type,
            host: HostInfo::current(),
            database: None,
            files: None,
        }
    }

    pub fn host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    pub fn database(mut self, artifact: Option<DatabaseArtifact>) -> Self {
        self.database = artifact;
        self
    }

    pub fn files(mut self, artifact: Option<FileArtifact>) -> Self {
        self.files = artifact;
        self
    }

    pub fn build(self, duration_secs: f64, errors: Vec<String>) -> BackupManifest {
        let total_size = self.database.as_ref().map_or(0, |d| d.size)
            + self.files.as_ref().map_or(0, |f| f.size);

        BackupManifest {
            metadata: RunMetadata {
                date: self.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                timestamp: self.run_id,
                run_type: self.run_type,
                duration: (duration_secs * 100.0).round() / 100.0,
                total_size,
                server: self.host,
                errors,
            },
            database: self.database,
            files: self.files,
        }
    }
}

impl BackupManifest {
    /// Write `manifest.json` into `run_dir` via a temporary file and rename.
    pub fn write_atomic(&self, run_dir: &Path) -> Result<()> {
        let target = run_dir.join(MANIFEST_FILENAME);
        let tmp = run_dir.join(format!(".{}.tmp", MANIFEST_FILENAME));

        let json = serde_json::to_vec_pretty(self)?;
        {
            let mut file = std::fs::File::create(&tmp).at(&tmp)?;
            file.write_all(&json).at(&tmp)?;
            file.sync_all().at(&tmp)?;
        }

        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(BackupError::fs(&target, e));
        }
        Ok(())
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(MANIFEST_FILENAME);
        let content = std::fs::read(&path).at(&path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}
