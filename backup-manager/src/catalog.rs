//! Enumeration of completed runs under the backup root.

use crate::executor::manifest::{BackupManifest, MANIFEST_FILENAME};
use crate::retention::run_date;
use crate::utils::errors::{BackupError, IoResultExt, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const LATEST: &str = "latest";

#[derive(Debug, Clone)]
pub struct RunEntry {
    pub run_id: String,
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

/// Runs that carry a readable manifest, newest first.
pub fn list_runs(root: &Path) -> Result<Vec<RunEntry>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::fs(root, e)),
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.at(root)?;
        let run_id = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if run_date(&run_id).is_none() || !path.join(MANIFEST_FILENAME).is_file() {
            continue;
        }
        match BackupManifest::load(&path) {
            Ok(manifest) => runs.push(RunEntry {
                run_id,
                path,
                manifest,
            }),
            Err(e) => warn!("Skipping {}: unreadable manifest: {}", run_id, e),
        }
    }

    // Run ids are timestamps, so lexical order is chronological.
    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    Ok(runs)
}

/// Find a run by id, or the newest one for `latest`.
pub fn resolve(root: &Path, run_id: &str) -> Result<RunEntry> {
    if run_id == LATEST {
        return list_runs(root)?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NotFound(format!("no backups under {}", root.display())));
    }

    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
        return Err(BackupError::NotFound(format!("invalid run id: {}", run_id)));
    }

    let path = root.join(run_id);
    if !path.join(MANIFEST_FILENAME).is_file() {
        return Err(BackupError::NotFound(format!(
            "no manifest for run {} under {}",
            run_id,
            root.display()
        )));
    }
    let manifest = BackupManifest::load(&path)?;
    Ok(RunEntry {
        run_id: run_id.to_string(),
        path,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::{ManifestBuilder, RunType};
    use chrono::Local;
    use tempfile::TempDir;

    fn write_run(root: &Path, run_id: &str) {
        let dir = root.join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        ManifestBuilder::new(run_id, Local::now(), RunType::Daily)
            .build(1.0, vec![])
            .write_atomic(&dir)
            .unwrap();
    }

    #[test]
    fn test_list_runs_newest_first() {
        let temp = TempDir::new().unwrap();
        write_run(temp.path(), "2026-03-01_02-00-00");
        write_run(temp.path(), "2026-03-03_02-00-00");
        write_run(temp.path(), "2026-03-02_02-00-00");
        std::fs::create_dir_all(temp.path().join("2026-03-04_02-00-00")).unwrap();
        std::fs::create_dir_all(temp.path().join("logs")).unwrap();

        let ids: Vec<_> = list_runs(temp.path())
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(
            ids,
            vec!["2026-03-03_02-00-00", "2026-03-02_02-00-00", "2026-03-01_02-00-00"]
        );
    }

    #[test]
    fn test_resolve_latest_and_explicit() {
        let temp = TempDir::new().unwrap();
        write_run(temp.path(), "2026-03-01_02-00-00");
        write_run(temp.path(), "2026-03-02_02-00-00");

        assert_eq!(resolve(temp.path(), LATEST).unwrap().run_id, "2026-03-02_02-00-00");
        let run = resolve(temp.path(), "2026-03-01_02-00-00").unwrap();
        assert_eq!(run.manifest.metadata.timestamp, "2026-03-01_02-00-00");
    }

    #[test]
    fn test_resolve_unknown_run() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(resolve(temp.path(), LATEST), Err(BackupError::NotFound(_))));
        assert!(matches!(
            resolve(temp.path(), "2020-01-01_00-00-00"),
            Err(BackupError::NotFound(_))
        ));
        assert!(matches!(resolve(temp.path(), "../etc"), Err(BackupError::NotFound(_))));
    }
}
