//! Configuration management for the backup manager.
//!
//! Loads configuration from a TOML file, then applies `.env` and environment
//! variable overrides.

use crate::archive::compression::Compression;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding run directories, logs and the lock file
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Upload tree archived by the files phase
    #[serde(default = "default_uploads_root")]
    pub uploads_root: PathBuf,

    /// Days a run directory is kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Weekday on which scheduled runs also archive the upload tree
    #[serde(default = "default_files_weekday")]
    pub files_weekday: String,

    /// Database dump compression (gzip, zstd, none)
    #[serde(default)]
    pub compression: Compression,

    /// Compression level (1-9 for gzip, 1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Block size used when streaming the dump through the compressor
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Log archiving progress every N files
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Seconds after which a lock file is considered abandoned
    #[serde(default = "default_lock_stale_after")]
    pub lock_stale_after_secs: u64,

    /// Name fragments excluded from the upload archive
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_db_name")]
    pub name: String,

    #[serde(default = "default_charset")]
    pub charset: String,

    /// Dump utility
    #[serde(default = "default_dump_command")]
    pub dump_command: String,

    /// Client used both for restores and schema statistics
    #[serde(default = "default_client_command")]
    pub client_command: String,
}

// Keeps the password out of logs.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("charset", &self.charset)
            .field("dump_command", &self.dump_command)
            .field("client_command", &self.client_command)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Endpoint receiving the JSON run report
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Only log the report
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression with seconds field
    #[serde(default = "default_cron")]
    pub cron: String,
}

// Default values
fn default_root() -> PathBuf {
    PathBuf::from("/var/backups/app")
}

fn default_uploads_root() -> PathBuf {
    PathBuf::from("/var/www/app/uploads")
}

/// Upper bound for `retention_days` (a hundred years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

fn default_retention_days() -> u32 {
    30
}

fn default_files_weekday() -> String {
    "sun".to_string()
}

fn default_compression_level() -> i32 {
    6
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_progress_interval() -> usize {
    100
}

fn default_lock_stale_after() -> u64 {
    2 * 60 * 60
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_db_user() -> String {
    "root".to_string()
}

fn default_db_name() -> String {
    "app".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_dump_command() -> String {
    "mysqldump".to_string()
}

fn default_client_command() -> String {
    "mysql".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cron() -> String {
    "0 0 2 * * *".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            uploads_root: default_uploads_root(),
            retention_days: default_retention_days(),
            files_weekday: default_files_weekday(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
            chunk_size: default_chunk_size(),
            progress_interval: default_progress_interval(),
            lock_stale_after_secs: default_lock_stale_after(),
            exclude: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            name: default_db_name(),
            charset: default_charset(),
            dump_command: default_dump_command(),
            client_command: default_client_command(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { cron: default_cron() }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Load the optional file, apply `.env`/environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BACKUP_ROOT") {
            self.backup.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("UPLOADS_ROOT") {
            self.backup.uploads_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = lookup("DB_PORT") {
            self.database.port = v
                .parse()
                .map_err(|_| BackupError::Config(format!("DB_PORT is not a port number: {}", v)))?;
        }
        if let Some(v) = lookup("DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = lookup("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.files_weekday()?;
        if self.backup.chunk_size == 0 {
            return Err(BackupError::Config("chunk_size must be greater than zero".into()));
        }
        if self.backup.progress_interval == 0 {
            return Err(BackupError::Config(
                "progress_interval must be greater than zero".into(),
            ));
        }
        if self.database.name.is_empty() {
            return Err(BackupError::Config("database name is empty".into()));
        }
        if self.backup.retention_days > MAX_RETENTION_DAYS {
            return Err(BackupError::Config(format!(
                "retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS, self.backup.retention_days
            )));
        }
        Ok(())
    }

    pub fn files_weekday(&self) -> Result<chrono::Weekday> {
        self.backup.files_weekday.parse().map_err(|_| {
            BackupError::Config(format!("invalid files_weekday: {}", self.backup.files_weekday))
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.backup.root.join("backup.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.backup.root.join("logs").join("backup.log")
    }

    pub fn lock_staleness(&self) -> Duration {
        Duration::from_secs(self.backup.lock_stale_after_secs)
    }
}
