//! Backup run orchestration.
//!
//! One invocation walks through these phases in order:
//!
//! ```text
//! Pending -> LockAcquired -> Database -> Files -> ManifestWritten
//!         -> RetentionSwept -> Reported -> Complete
//! ```
//!
//! Phase failures are recorded in the run's error list and the pipeline
//! carries on, so a manifest and a report are produced for every run that got
//! past the lock. Only a missing lock or an uncreatable run directory stop a
//! run before its phases execute.

pub mod manifest;

use crate::archive::files::FileArchiver;
use crate::config::Config;
use crate::daemon::lock::LockManager;
use crate::database::schema::MysqlSchemaInspector;
use crate::database::{DatabaseArchiver, DumpCompression};
use crate::process::CommandRunner;
use crate::report::{Reporter, RetentionSummary, RunReport, RunStatus};
use crate::retention::RetentionSweeper;
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::errors::{BackupError, IoResultExt, Result};
use crate::verify::IntegrityVerifier;
use chrono::{DateTime, Datelike, Local, Weekday};
use manifest::{DatabaseArtifact, FileArtifact, HostInfo, ManifestBuilder, RunType};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Format of run identifiers and run directory names.
pub const RUN_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Suffixed names tried when a run directory for the same second exists.
const MAX_RUN_ID_SUFFIX: u32 = 99;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupOptions {
    /// Full run: database and upload tree
    pub full: bool,
    /// Archive the upload tree outside its scheduled weekday
    pub files: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run holds the lock; nothing was touched.
    AlreadyRunning,
    Completed(RunReport),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        match self {
            RunOutcome::AlreadyRunning => true,
            RunOutcome::Completed(report) => report.success(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    LockAcquired,
    Database(PhaseState),
    Files(PhaseState),
    ManifestWritten,
    RetentionSwept,
    Reported,
    Complete,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Pending => write!(f, "pending"),
            RunPhase::LockAcquired => write!(f, "lock_acquired"),
            RunPhase::Database(s) => write!(f, "db_phase:{:?}", s),
            RunPhase::Files(s) => write!(f, "files_phase:{:?}", s),
            RunPhase::ManifestWritten => write!(f, "manifest_written"),
            RunPhase::RetentionSwept => write!(f, "retention_swept"),
            RunPhase::Reported => write!(f, "reported"),
            RunPhase::Complete => write!(f, "complete"),
            RunPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable state of one invocation.
#[derive(Debug)]
pub struct BackupRun {
    pub id: String,
    pub started_at: DateTime<Local>,
    pub run_type: RunType,
    pub errors: Vec<String>,
    pub phase: RunPhase,
    /// Backup phases that finished and passed verification
    completed_phases: usize,
    clock: Instant,
}

impl BackupRun {
    pub fn new(started_at: DateTime<Local>, run_type: RunType) -> Self {
        Self {
            id: started_at.format(RUN_ID_FORMAT).to_string(),
            started_at,
            run_type,
            errors: Vec::new(),
            phase: RunPhase::Pending,
            completed_phases: 0,
            clock: Instant::now(),
        }
    }

    pub fn advance(&mut self, phase: RunPhase) {
        info!(run_id = %self.id, from = %self.phase, to = %phase, "Run phase");
        if let RunPhase::Database(PhaseState::Done) | RunPhase::Files(PhaseState::Done) = phase {
            self.completed_phases += 1;
        }
        self.phase = phase;
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_run(&self.errors, self.completed_phases > 0)
    }

    pub fn record_error(&mut self, message: String) {
        error!(run_id = %self.id, "{}", message);
        self.errors.push(message);
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct BackupExecutor {
    config: Config,
    database: DatabaseArchiver,
    files: FileArchiver,
    reporter: Reporter,
}

impl BackupExecutor {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, reporter: Reporter) -> Self {
        let inspector = Arc::new(MysqlSchemaInspector::new(
            runner.clone(),
            config.database.clone(),
        ));
        let database = DatabaseArchiver::new(
            runner,
            inspector,
            config.database.clone(),
            DumpCompression {
                codec: config.backup.compression,
                level: config.backup.compression_level,
                chunk_size: config.backup.chunk_size,
            },
        );
        let files = FileArchiver::new(
            &config.backup.uploads_root,
            config.backup.exclude.clone(),
            config.backup.progress_interval,
        );
        Self {
            config,
            database,
            files,
            reporter,
        }
    }

    /// Whether the upload tree is archived on `today`.
    pub fn files_phase_due(&self, options: &BackupOptions, today: Weekday) -> Result<bool> {
        Ok(options.full || options.files || today == self.config.files_weekday()?)
    }

    pub async fn execute(&self, options: BackupOptions) -> Result<RunOutcome> {
        let root = self.config.backup.root.clone();
        std::fs::create_dir_all(&root).at(&root)?;

        let lock = LockManager::new(self.config.lock_path(), self.config.lock_staleness());
        let Some(guard) = lock.acquire()? else {
            info!("Another backup run is active, exiting");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let started_at = Local::now();
        let with_files = self.files_phase_due(&options, started_at.weekday())?;
        let run_type = if with_files { RunType::Full } else { RunType::Daily };
        let mut run = BackupRun::new(started_at, run_type);
        run.advance(RunPhase::LockAcquired);

        let run_dir = match create_run_dirs(&root, &run.id, with_files) {
            Ok((id, run_dir)) => {
                run.id = id;
                run_dir
            }
            Err(e) => {
                run.record_error(format!("Cannot create run directory: {}", e));
                run.advance(RunPhase::Failed);
                let report = self.build_report(&run, None, None, None);
                self.reporter.deliver(&report).await;
                drop(guard);
                return Err(e);
            }
        };
        info!(run_id = %run.id, run_type = %run.run_type, "Starting backup run");

        let database = self.database_phase(&mut run, &run_dir).await;
        let files = if with_files {
            self.files_phase(&mut run, &run_dir).await
        } else {
            info!(
                "Upload archive not due today (scheduled on {})",
                self.config.backup.files_weekday
            );
            run.advance(RunPhase::Files(PhaseState::Skipped));
            None
        };

        let manifest = ManifestBuilder::new(&run.id, run.started_at, run.run_type)
            .database(database.clone())
            .files(files.clone())
            .build(run.elapsed_secs(), run.errors.clone());
        match manifest.write_atomic(&run_dir) {
            Ok(()) => run.advance(RunPhase::ManifestWritten),
            Err(e) => run.record_error(format!("Manifest write failed: {}", e)),
        }

        let retention = self.retention_phase(&mut run, &root).await;

        let report = self.build_report(&run, database, files, retention);
        self.reporter.deliver(&report).await;
        run.advance(RunPhase::Reported);

        drop(guard);
        run.advance(if run.success() {
            RunPhase::Complete
        } else {
            RunPhase::Failed
        });
        info!(
            run_id = %run.id,
            status = %report.status,
            duration = %format_duration(report.duration_secs.round() as u64),
            size = %format_bytes(report.total_size),
            "Backup run finished"
        );

        Ok(RunOutcome::Completed(report))
    }

    async fn database_phase(&self, run: &mut BackupRun, run_dir: &Path) -> Option<DatabaseArtifact> {
        run.advance(RunPhase::Database(PhaseState::Running));
        let out_dir = run_dir.join("database");

        match self.database.archive(&out_dir).await {
            Ok(artifact) => {
                let path = out_dir.join(&artifact.file);
                match IntegrityVerifier::verify_database(&path) {
                    Ok(()) => run.advance(RunPhase::Database(PhaseState::Done)),
                    Err(e) => {
                        run.record_error(format!("Database verification failed: {}", e));
                        run.advance(RunPhase::Database(PhaseState::Failed));
                    }
                }
                Some(artifact)
            }
            Err(e) => {
                run.record_error(format!("Database backup failed: {}", e));
                run.advance(RunPhase::Database(PhaseState::Failed));
                None
            }
        }
    }

    async fn files_phase(&self, run: &mut BackupRun, run_dir: &Path) -> Option<FileArtifact> {
        run.advance(RunPhase::Files(PhaseState::Running));
        let out_dir = run_dir.join("files");

        match self.files.archive(&out_dir).await {
            Ok(Some(artifact)) => {
                if !artifact.skipped.is_empty() {
                    run.record_error(format!(
                        "File archive left out {} entries with non-UTF-8 names",
                        artifact.skipped.len()
                    ));
                }
                let path = out_dir.join(&artifact.file);
                match IntegrityVerifier::verify_archive(&path) {
                    Ok(entries) => {
                        info!("Archive verified ({} entries)", entries);
                        run.advance(RunPhase::Files(PhaseState::Done));
                    }
                    // An empty upload tree legitimately yields an empty archive.
                    Err(e) if artifact.count == 0 => {
                        warn!("{}", e);
                        run.advance(RunPhase::Files(PhaseState::Done));
                    }
                    Err(e) => {
                        run.record_error(format!("File archive verification failed: {}", e));
                        run.advance(RunPhase::Files(PhaseState::Failed));
                    }
                }
                Some(artifact)
            }
            Ok(None) => {
                run.advance(RunPhase::Files(PhaseState::Skipped));
                None
            }
            Err(e) => {
                run.record_error(format!("File backup failed: {}", e));
                run.advance(RunPhase::Files(PhaseState::Failed));
                None
            }
        }
    }

    async fn retention_phase(&self, run: &mut BackupRun, root: &Path) -> Option<RetentionSummary> {
        let sweeper = RetentionSweeper::new(root, self.config.backup.retention_days);
        let result = tokio::task::spawn_blocking(move || sweeper.sweep()).await;

        let summary = match result {
            Ok(Ok(report)) => {
                for failure in &report.failures {
                    run.record_error(format!("Retention: could not remove {}", failure));
                }
                Some(RetentionSummary {
                    deleted: report.deleted,
                    freed_bytes: report.freed_bytes,
                })
            }
            Ok(Err(e)) => {
                run.record_error(format!("Retention sweep failed: {}", e));
                None
            }
            Err(e) => {
                run.record_error(format!("Retention sweep failed: {}", e));
                None
            }
        };
        run.advance(RunPhase::RetentionSwept);
        summary
    }

    fn build_report(
        &self,
        run: &BackupRun,
        database: Option<DatabaseArtifact>,
        files: Option<FileArtifact>,
        retention: Option<RetentionSummary>,
    ) -> RunReport {
        let total_size =
            database.as_ref().map_or(0, |d| d.size) + files.as_ref().map_or(0, |f| f.size);
        RunReport {
            run_id: run.id.clone(),
            run_type: run.run_type,
            status: run.status(),
            hostname: HostInfo::current().hostname,
            started_at: run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            duration_secs: (run.elapsed_secs() * 100.0).round() / 100.0,
            total_size,
            database,
            files,
            retention,
            errors: run.errors.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Claim a fresh run directory under `root`, returning its final id.
///
/// A directory left by an earlier run in the same second is never reused;
/// the id gets a numeric suffix instead, keeping the leading date intact.
fn create_run_dirs(root: &Path, id: &str, with_files: bool) -> Result<(String, PathBuf)> {
    let (id, run_dir) = claim_run_dir(root, id)?;
    let database = run_dir.join("database");
    std::fs::create_dir(&database).at(&database)?;
    if with_files {
        let files = run_dir.join("files");
        std::fs::create_dir(&files).at(&files)?;
    }
    Ok((id, run_dir))
}

fn claim_run_dir(root: &Path, id: &str) -> Result<(String, PathBuf)> {
    let candidates = std::iter::once(id.to_string())
        .chain((1..=MAX_RUN_ID_SUFFIX).map(|n| format!("{}_{:02}", id, n)));
    for candidate in candidates {
        let dir = root.join(&candidate);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((candidate, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("Run directory {} already exists, trying next name", dir.display());
            }
            Err(e) => return Err(BackupError::fs(&dir, e)),
        }
    }
    Err(BackupError::fs(
        root,
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free run directory name for {}", id),
        ),
    ))
}
