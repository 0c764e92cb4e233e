//! Expiry of old run directories.
//!
//! Age is taken from the date at the start of each directory name, never from
//! filesystem timestamps. Names that do not start with a `YYYY-MM-DD` date are
//! not touched.

use crate::fs::walker::disk_usage;
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{BackupError, IoResultExt, Result};
use chrono::{Local, NaiveDate};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    /// Directories that could not be removed
    pub failures: Vec<String>,
}

pub struct RetentionSweeper {
    root: PathBuf,
    retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(root: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            root: root.into(),
            retention_days,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_on(Local::now().date_naive())
    }

    /// Sweep relative to `today`.
    pub fn sweep_on(&self, today: NaiveDate) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let Some(cutoff) =
            today.checked_sub_signed(chrono::Duration::days(i64::from(self.retention_days)))
        else {
            warn!(
                retention_days = self.retention_days,
                "Retention window reaches past the earliest date, keeping every run"
            );
            return Ok(report);
        };

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(BackupError::fs(&self.root, e)),
        };

        for entry in entries {
            let entry = entry.at(&self.root)?;
            let path = entry.path();
            if !entry.file_type().at(&path)?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(date) = run_date(&name) else {
                debug!("Leaving {} alone, no date in name", name);
                continue;
            };
            if date >= cutoff {
                continue;
            }

            let size = disk_usage(&path);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!("Removed expired backup {} ({})", name, format_bytes(size));
                    report.deleted += 1;
                    report.freed_bytes += size;
                }
                Err(e) => {
                    warn!("Failed to remove expired backup {}: {}", path.display(), e);
                    report.failures.push(format!("{}: {}", name, e));
                }
            }
        }

        info!(
            deleted = report.deleted,
            freed = %format_bytes(report.freed_bytes),
            retention_days = self.retention_days,
            "Retention sweep finished"
        );
        Ok(report)
    }
}

/// Date encoded in the first ten characters of a run directory name.
pub fn run_date(name: &str) -> Option<NaiveDate> {
    let token = name.get(..10)?;
    NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 31).unwrap()
    }

    fn run_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("database")).unwrap();
        fs::write(dir.join("database/app.sql.gz"), vec![0u8; 64]).unwrap();
        dir
    }

    #[test]
    fn test_run_date() {
        assert_eq!(
            run_date("2026-03-01_02-00-00"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(run_date("logs"), None);
        assert_eq!(run_date("2026-13-01_x"), None);
        assert_eq!(run_date("2026-03"), None);
    }

    #[test]
    fn test_cutoff_boundary() {
        let temp = TempDir::new().unwrap();
        let on_cutoff = run_dir(temp.path(), "2026-03-01_02-00-00");
        let day_older = run_dir(temp.path(), "2026-02-28_02-00-00");

        let report = RetentionSweeper::new(temp.path(), 30).sweep_on(today()).unwrap();

        assert!(on_cutoff.exists());
        assert!(!day_older.exists());
        assert_eq!(report.deleted, 1);
        assert_eq!(report.freed_bytes, 64);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_unknown_names_and_files_are_kept() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("logs")).unwrap();
        fs::create_dir_all(temp.path().join("manual-copy")).unwrap();
        fs::write(temp.path().join("2001-01-01.txt"), b"not a dir").unwrap();

        let report = RetentionSweeper::new(temp.path(), 1).sweep_on(today()).unwrap();

        assert_eq!(report.deleted, 0);
        assert!(temp.path().join("logs").exists());
        assert!(temp.path().join("manual-copy").exists());
        assert!(temp.path().join("2001-01-01.txt").exists());
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let temp = TempDir::new().unwrap();
        let ancient = run_dir(temp.path(), "0001-01-01_02-00-00");

        let report = RetentionSweeper::new(temp.path(), u32::MAX).sweep_on(today()).unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(ancient.exists());
    }

    #[test]
    fn test_missing_root_is_empty_sweep() {
        let temp = TempDir::new().unwrap();
        let report = RetentionSweeper::new(temp.path().join("absent"), 30)
            .sweep_on(today())
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
