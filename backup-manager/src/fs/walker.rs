//! Directory traversal for archiving.
//!
//! Yields every regular file and every empty directory below a root, depth
//! first, with paths relative to the root. Callers fold over the iterator to
//! accumulate counts.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Name fragments to skip; matching directories are pruned
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    EmptyDir,
}

/// An archivable entry discovered during walking
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (zero for directories)
    pub size: u64,

    pub kind: EntryKind,
}

impl TreeEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_file() {
            let size = entry.metadata()?.len();
            return Ok(Some(Self {
                path,
                relative_path,
                size,
                kind: EntryKind::File,
            }));
        }

        if file_type.is_dir() && entry.depth() > 0 && is_empty_dir(&path)? {
            return Ok(Some(Self {
                path,
                relative_path,
                size: 0,
                kind: EntryKind::EmptyDir,
            }));
        }

        // Non-empty directories are implied by their files; sockets, fifos and
        // unfollowed symlinks are not archived.
        Ok(None)
    }

    /// Archive entry name: relative path with `/` separators.
    ///
    /// `None` when a component is not valid UTF-8; zip names cannot carry
    /// such names without rewriting them.
    pub fn archive_name(&self) -> Option<String> {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.join("/"))
    }
}

/// Walk `root`, yielding files and empty directories.
///
/// # Example
/// ```no_run
/// use backup_manager::fs::walker::{walk_tree, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_tree(Path::new("/data"), &WalkOptions::default())
///     .filter_map(Result::ok)
///     .count();
/// println!("Found {} entries", files);
/// ```
pub fn walk_tree<'a>(
    root: &'a Path,
    options: &'a WalkOptions,
) -> impl Iterator<Item = std::io::Result<TreeEntry>> + 'a {
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    walker
        .into_iter()
        .filter_entry(move |e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns))
        .filter_map(move |entry| match entry {
            Ok(entry) => TreeEntry::from_entry(&entry, root).transpose(),
            Err(e) => Some(Err(e.into())),
        })
}

/// Totals accumulated over a walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: usize,
    pub empty_dirs: usize,
    pub bytes: u64,
}

impl TreeStats {
    pub fn record(mut self, entry: &TreeEntry) -> Self {
        match entry.kind {
            EntryKind::File => {
                self.files += 1;
                self.bytes += entry.size;
            }
            EntryKind::EmptyDir => self.empty_dirs += 1,
        }
        self
    }

    pub fn entries(&self) -> usize {
        self.files + self.empty_dirs
    }
}

/// Count files and bytes below `root`.
pub fn tree_stats(root: &Path, options: &WalkOptions) -> std::io::Result<TreeStats> {
    walk_tree(root, options).try_fold(TreeStats::default(), |stats, entry| {
        entry.map(|e| stats.record(&e))
    })
}

/// Total size of regular files below `path`, following no links.
pub fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<TreeEntry>> {
        walk_tree(root, options).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.kind == EntryKind::File));
        assert!(entries
            .iter()
            .any(|e| e.archive_name().as_deref() == Some("subdir/file2.txt")));

        Ok(())
    }

    #[test]
    fn test_empty_directories_are_entries() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("avatars/empty"))?;
        fs::write(temp_dir.path().join("avatars/a.png"), b"png")?;

        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        let dirs: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::EmptyDir)
            .filter_map(|e| e.archive_name())
            .collect();
        assert_eq!(dirs, vec!["avatars/empty".to_string()]);

        Ok(())
    }

    #[test]
    fn test_tree_stats() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("empty"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?; // 5 bytes
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?; // 7 bytes

        let stats = tree_stats(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(stats.files, 2);
        assert_eq!(stats.empty_dirs, 1);
        assert_eq!(stats.bytes, 12);
        assert_eq!(stats.entries(), 3);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns_prune_directories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("cache"))?;
        fs::write(temp_dir.path().join("cache/big.bin"), b"skip")?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;

        let options = WalkOptions {
            exclude_patterns: vec!["cache".to_string(), ".DS_Store".to_string()],
            ..Default::default()
        };
        let entries = collect(temp_dir.path(), &options)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path.to_str().unwrap(), "file.txt");

        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_name_has_no_archive_name() -> std::io::Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"x")?;

        let entries = collect(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].archive_name(), None);
        Ok(())
    }

    #[test]
    fn test_disk_usage() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("db"))?;
        fs::write(temp_dir.path().join("db/dump.sql"), vec![0u8; 300])?;
        fs::write(temp_dir.path().join("manifest.json"), vec![0u8; 20])?;

        assert_eq!(disk_usage(temp_dir.path()), 320);
        Ok(())
    }
}
