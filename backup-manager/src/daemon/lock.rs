//! Advisory run lock.
//!
//! A single JSON file under the backup root records the owning process id and
//! acquisition time. A lock older than the staleness threshold is treated as
//! abandoned and reclaimed.
//!
//! Reclaiming is serialized through a `<lock>.reclaim` marker created with
//! `create_new`. Inside it the lock is removed only if its bytes still match
//! the record that was judged stale, so a fresh lock taken by a concurrent
//! reclaimer is never deleted.

use crate::utils::errors::{BackupError, IoResultExt, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A reclaim marker older than this was left by a crashed process.
const RECLAIM_MARKER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Existing lock as observed on disk.
#[derive(Debug, Clone)]
pub struct LockHolder {
    pub pid: u32,
    pub age: Duration,
}

impl LockHolder {
    pub fn into_error(self) -> BackupError {
        BackupError::LockContention {
            pid: self.pid,
            age_secs: self.age.as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock.
    ///
    /// `Ok(None)` means a live lock is held by someone else.
    pub fn acquire(&self) -> Result<Option<LockGuard>> {
        // Later passes only happen after the lock file vanished or a stale
        // lock was removed.
        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let written = serde_json::to_vec(&record)
                        .map_err(BackupError::from)
                        .and_then(|json| file.write_all(&json).at(&self.path));
                    if let Err(e) = written {
                        let _ = std::fs::remove_file(&self.path);
                        return Err(e);
                    }
                    debug!(path = %self.path.display(), pid = record.pid, "Lock acquired");
                    return Ok(Some(LockGuard {
                        path: self.path.clone(),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let content = match std::fs::read(&self.path) {
                        Ok(content) => content,
                        // Removed between our create and our read.
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(BackupError::fs(&self.path, e)),
                    };
                    let holder = match self.holder_from(&content)? {
                        Some(holder) => holder,
                        None => continue,
                    };
                    if holder.age <= self.stale_after {
                        info!(
                            pid = holder.pid,
                            age_secs = holder.age.as_secs(),
                            "Lock is held by another run"
                        );
                        return Ok(None);
                    }
                    warn!(
                        pid = holder.pid,
                        age_secs = holder.age.as_secs(),
                        "Reclaiming stale lock"
                    );
                    if !self.remove_if_unchanged(&content)? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(BackupError::fs(&self.path, e)),
            }
        }
        Ok(None)
    }

    /// Current lock owner, if a lock file exists.
    ///
    /// Age comes from the recorded timestamp, falling back to the file's
    /// modification time when the content is unreadable.
    pub fn holder(&self) -> Result<Option<LockHolder>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::fs(&self.path, e)),
        };
        self.holder_from(&content)
    }

    fn holder_from(&self, content: &[u8]) -> Result<Option<LockHolder>> {
        if let Ok(record) = serde_json::from_slice::<LockRecord>(content) {
            let age = (Utc::now() - record.acquired_at).to_std().unwrap_or_default();
            return Ok(Some(LockHolder {
                pid: record.pid,
                age,
            }));
        }

        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::fs(&self.path, e)),
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        Ok(Some(LockHolder { pid: 0, age }))
    }

    fn reclaim_marker(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".reclaim");
        self.path.with_file_name(name)
    }

    /// Delete the lock file if it still holds `judged`.
    ///
    /// Returns false when another process is reclaiming or the lock changed
    /// since it was read.
    fn remove_if_unchanged(&self, judged: &[u8]) -> Result<bool> {
        let marker = self.reclaim_marker();
        let _marker = match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => MarkerGuard(marker),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let age = std::fs::metadata(&marker)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                if age.is_some_and(|age| age > RECLAIM_MARKER_TIMEOUT) {
                    warn!("Removing abandoned reclaim marker {}", marker.display());
                    release_path(&marker);
                } else {
                    debug!("Stale lock is being reclaimed by another process");
                }
                return Ok(false);
            }
            Err(e) => return Err(BackupError::fs(&marker, e)),
        };

        match std::fs::read(&self.path) {
            Ok(current) if current == judged => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(BackupError::fs(&self.path, e)),
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(BackupError::fs(&self.path, e)),
        }
    }

    /// Delete the lock file if present. Never fails.
    pub fn release(&self) {
        release_path(&self.path);
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        release_path(&self.path);
    }
}

struct MarkerGuard(PathBuf);

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        release_path(&self.0);
    }
}

fn release_path(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Lock released"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove lock {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);

    fn write_record(path: &Path, pid: u32, age: chrono::Duration) {
        let record = LockRecord {
            pid,
            acquired_at: Utc::now() - age,
        };
        std::fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);

        let guard = manager.acquire().unwrap().unwrap();
        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(manager.path()).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());

        drop(guard);
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_fresh_lock_blocks_second_acquire() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);

        let _guard = manager.acquire().unwrap().unwrap();
        assert!(manager.acquire().unwrap().is_none());
        assert!(manager.path().exists());
    }

    #[test]
    fn test_fresh_foreign_lock_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        write_record(manager.path(), 4242, chrono::Duration::minutes(30));

        assert!(manager.acquire().unwrap().is_none());
        let holder = manager.holder().unwrap().unwrap();
        assert_eq!(holder.pid, 4242);
        assert!(matches!(
            holder.into_error(),
            BackupError::LockContention { pid: 4242, .. }
        ));
    }

    #[test]
    fn test_stale_lock_is_reclaimed_and_overwritten() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        write_record(manager.path(), 4242, chrono::Duration::hours(3));

        let _guard = manager.acquire().unwrap().unwrap();
        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(manager.path()).unwrap()).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(Utc::now() - record.acquired_at < chrono::Duration::minutes(1));
    }

    #[test]
    fn test_racing_reclaimers_leave_one_holder() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        const THREADS: usize = 8;

        for _ in 0..50 {
            let temp = TempDir::new().unwrap();
            let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
            write_record(manager.path(), 4242, chrono::Duration::hours(3));

            let start = Arc::new(Barrier::new(THREADS));
            let settled = Arc::new(Barrier::new(THREADS));
            let holders = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let manager = manager.clone();
                    let (start, settled, holders) =
                        (start.clone(), settled.clone(), holders.clone());
                    std::thread::spawn(move || {
                        start.wait();
                        let guard = manager.acquire().unwrap();
                        if guard.is_some() {
                            holders.fetch_add(1, Ordering::SeqCst);
                        }
                        // Keep every guard alive until all threads are done.
                        settled.wait();
                        drop(guard);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(holders.load(Ordering::SeqCst), 1);
            assert!(!manager.reclaim_marker().exists());
        }
    }

    #[test]
    fn test_changed_lock_is_not_removed() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        write_record(manager.path(), 4242, chrono::Duration::hours(3));
        let judged = std::fs::read(manager.path()).unwrap();
        write_record(manager.path(), 5151, chrono::Duration::zero());

        assert!(!manager.remove_if_unchanged(&judged).unwrap());
        assert_eq!(manager.holder().unwrap().unwrap().pid, 5151);
    }

    #[test]
    fn test_reclaim_in_progress_backs_off() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        write_record(manager.path(), 4242, chrono::Duration::hours(3));
        std::fs::write(manager.reclaim_marker(), b"").unwrap();

        assert!(manager.acquire().unwrap().is_none());
        assert_eq!(manager.holder().unwrap().unwrap().pid, 4242);
    }

    #[test]
    fn test_unreadable_lock_falls_back_to_mtime() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        std::fs::write(manager.path(), b"12345").unwrap();

        // Just written, so the mtime is fresh.
        assert!(manager.acquire().unwrap().is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("backup.lock"), TWO_HOURS);
        manager.release();

        let guard = manager.acquire().unwrap().unwrap();
        manager.release();
        manager.release();
        drop(guard);
        assert!(manager.holder().unwrap().is_none());
    }
}
