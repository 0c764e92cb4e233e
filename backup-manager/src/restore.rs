//! Restoring a recorded run.
//!
//! Steps run in order (database, then files) under the same lock as backups.
//! The first failing step aborts the remaining ones. Steps that already
//! succeeded are not rolled back.

use crate::archive::compression::{calculate_checksum, decompress_file, Compression};
use crate::catalog;
use crate::config::Config;
use crate::daemon::lock::LockManager;
use crate::database::schema::client_command;
use crate::executor::manifest::{DatabaseArtifact, FileArtifact};
use crate::process::CommandRunner;
use crate::utils::errors::{BackupError, IoResultExt, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Run directory name, or `latest`
    pub run_id: String,
    pub database: bool,
    pub files: bool,
}

impl RestoreRequest {
    /// Selecting neither step means both.
    pub fn new(run_id: impl Into<String>, database: bool, files: bool) -> Self {
        let both = !database && !files;
        Self {
            run_id: run_id.into(),
            database: database || both,
            files: files || both,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub run_id: String,
    pub database_restored: bool,
    pub files_restored: bool,
    /// Where the previous upload tree was moved
    pub safety_path: Option<PathBuf>,
}

pub struct RestoreOrchestrator {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

impl RestoreOrchestrator {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreSummary> {
        let lock = LockManager::new(self.config.lock_path(), self.config.lock_staleness());
        let _guard = match lock.acquire()? {
            Some(guard) => guard,
            None => {
                return Err(match lock.holder()? {
                    Some(holder) => holder.into_error(),
                    None => BackupError::LockContention { pid: 0, age_secs: 0 },
                })
            }
        };

        let run = catalog::resolve(&self.config.backup.root, &request.run_id)?;
        info!(
            run_id = %run.run_id,
            database = request.database,
            files = request.files,
            "Starting restore"
        );

        let mut summary = RestoreSummary {
            run_id: run.run_id.clone(),
            ..Default::default()
        };

        if request.database {
            match &run.manifest.database {
                Some(artifact) => {
                    if let Err(e) = self.restore_database(&run.path, artifact).await {
                        log_abort("database", &summary, &e);
                        return Err(e);
                    }
                    summary.database_restored = true;
                }
                None => warn!("Run {} has no database section, skipping database restore", run.run_id),
            }
        }

        if request.files {
            match &run.manifest.files {
                Some(artifact) => match self.restore_files(&run.path, artifact).await {
                    Ok(safety) => {
                        summary.files_restored = true;
                        summary.safety_path = safety;
                    }
                    Err(e) => {
                        log_abort("files", &summary, &e);
                        return Err(e);
                    }
                },
                None => warn!("Run {} has no files section, skipping file restore", run.run_id),
            }
        }

        info!(
            run_id = %summary.run_id,
            database = summary.database_restored,
            files = summary.files_restored,
            "Restore finished"
        );
        Ok(summary)
    }

    async fn restore_database(&self, run_dir: &Path, artifact: &DatabaseArtifact) -> Result<()> {
        let dump = run_dir.join("database").join(&artifact.file);
        verify_checksum(&dump, &artifact.checksum).await?;

        let codec = Compression::from_path(&dump);
        // Removed on drop, whatever the outcome.
        let scratch = if codec.is_enabled() {
            let temp = tempfile::Builder::new()
                .prefix(".restore-")
                .suffix(".sql")
                .tempfile_in(run_dir)
                .at(run_dir)?;
            let (src, dest) = (dump.clone(), temp.path().to_path_buf());
            let bytes =
                tokio::task::spawn_blocking(move || decompress_file(&src, &dest, codec)).await??;
            info!("Decompressed {} ({} bytes)", dump.display(), bytes);
            Some(temp)
        } else {
            None
        };
        let input = scratch.as_ref().map_or(dump.as_path(), |t| t.path());

        let db = &self.config.database;
        let cmd = client_command(db).arg(&db.name).stdin_file(input);
        info!(database = %db.name, host = %db.host, "Loading dump");
        self.runner.run(&cmd).await?.check(&db.client_command)?;

        info!("Database {} restored from {}", db.name, artifact.file);
        Ok(())
    }

    /// Returns the path the previous tree was moved to, if there was one.
    async fn restore_files(&self, run_dir: &Path, artifact: &FileArtifact) -> Result<Option<PathBuf>> {
        let archive = run_dir.join("files").join(&artifact.file);
        verify_checksum(&archive, &artifact.checksum).await?;

        let target = self.config.backup.uploads_root.clone();
        let safety = if target.exists() {
            let safety = safety_path(&target);
            std::fs::rename(&target, &safety).at(&target)?;
            info!("Moved {} aside to {}", target.display(), safety.display());
            Some(safety)
        } else {
            None
        };
        std::fs::create_dir_all(&target).at(&target)?;

        let dest = target.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<usize> {
            let file = std::fs::File::open(&archive).at(&archive)?;
            let mut zip = zip::ZipArchive::new(file)?;
            zip.extract(&dest)?;
            Ok(zip.len())
        })
        .await
        .map_err(BackupError::from)
        .and_then(|r| r);
        let entries = match (extracted, &safety) {
            (Ok(entries), _) => entries,
            (Err(e), Some(safety)) => {
                error!(
                    uploads = %target.display(),
                    safety = %safety.display(),
                    "Extraction failed, previous upload tree kept aside"
                );
                return Err(BackupError::Extraction {
                    target,
                    safety: safety.clone(),
                    source: Box::new(e),
                });
            }
            (Err(e), None) => return Err(e),
        };

        info!("Extracted {} entries into {}", entries, target.display());
        Ok(safety)
    }
}

fn safety_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "uploads".to_string());
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    target.with_file_name(format!("{}.pre-restore-{}", name, stamp))
}

async fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    if !path.is_file() {
        return Err(BackupError::NotFound(format!("artifact {} is missing", path.display())));
    }
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || calculate_checksum(&owned)).await??;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(BackupError::Integrity(format!(
            "checksum mismatch for {}: expected {}, found {}",
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

fn log_abort(step: &str, summary: &RestoreSummary, err: &BackupError) {
    let mut done = Vec::new();
    if summary.database_restored {
        done.push("database");
    }
    error!(
        run_id = %summary.run_id,
        completed = ?done,
        "Restore aborted during {} step: {}",
        step,
        err
    );
}
