//! Upload tree archiving.
//!
//! Packs every regular file and empty directory under the uploads root into a
//! deflated zip archive, then checksums the result.

use crate::archive::compression::{calculate_checksum, space_saving};
use crate::executor::manifest::FileArtifact;
use crate::fs::walker::{walk_tree, EntryKind, TreeEntry, TreeStats, WalkOptions};
use crate::transfer::progress::{format_bytes, format_speed, ProgressTracker};
use crate::utils::errors::{IoResultExt, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARCHIVE_NAME: &str = "uploads.zip";

#[derive(Debug, Clone)]
pub struct FileArchiver {
    source: PathBuf,
    walk_options: WalkOptions,
    progress_interval: usize,
}

impl FileArchiver {
    pub fn new(source: impl Into<PathBuf>, exclude_patterns: Vec<String>, progress_interval: usize) -> Self {
        Self {
            source: source.into(),
            walk_options: WalkOptions {
                exclude_patterns,
                ..Default::default()
            },
            progress_interval,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Archive the tree into `out_dir`.
    ///
    /// Returns `Ok(None)` when the source root does not exist.
    pub async fn archive(&self, out_dir: &Path) -> Result<Option<FileArtifact>> {
        let archiver = self.clone();
        let out_dir = out_dir.to_path_buf();
        tokio::task::spawn_blocking(move || archiver.archive_blocking(&out_dir)).await?
    }

    fn archive_blocking(&self, out_dir: &Path) -> Result<Option<FileArtifact>> {
        if !self.source.exists() {
            warn!(
                "Uploads directory {} does not exist, skipping file archive",
                self.source.display()
            );
            return Ok(None);
        }

        let archive_path = out_dir.join(ARCHIVE_NAME);
        info!(
            "Archiving {} into {}",
            self.source.display(),
            archive_path.display()
        );

        let file = File::create(&archive_path).at(&archive_path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let mut tracker = ProgressTracker::new(self.progress_interval);
        let mut stats = TreeStats::default();
        let mut skipped = Vec::new();

        for entry in walk_tree(&self.source, &self.walk_options) {
            let entry = entry.at(&self.source)?;
            let Some(name) = entry.archive_name() else {
                warn!(
                    "Skipping {}: name is not valid UTF-8",
                    entry.path.display()
                );
                skipped.push(entry.relative_path.to_string_lossy().into_owned());
                continue;
            };
            add_entry(&mut zip, &name, &entry)?;
            stats = stats.record(&entry);

            if entry.kind == EntryKind::File {
                if let Some(snap) = tracker.record(entry.size) {
                    info!(
                        "Archived {} files ({}, {})",
                        snap.files_processed,
                        format_bytes(snap.bytes_processed),
                        format_speed(snap.bytes_per_second)
                    );
                }
            }
        }

        zip.finish()?.flush().at(&archive_path)?;

        let size = std::fs::metadata(&archive_path).at(&archive_path)?.len();
        let checksum = calculate_checksum(&archive_path)?;
        let compression_ratio = space_saving(size, stats.bytes);

        info!(
            files = stats.files,
            empty_dirs = stats.empty_dirs,
            original = %format_bytes(stats.bytes),
            archive = %format_bytes(size),
            skipped = skipped.len(),
            "File archive complete"
        );

        Ok(Some(FileArtifact {
            file: ARCHIVE_NAME.to_string(),
            size,
            checksum,
            count: stats.files,
            original_size: stats.bytes,
            compression_ratio,
            skipped,
        }))
    }
}

fn add_entry<W: Write + io::Seek>(zip: &mut ZipWriter<W>, name: &str, entry: &TreeEntry) -> Result<()> {
    match entry.kind {
        EntryKind::EmptyDir => {
            let options = FileOptions::default().compression_method(CompressionMethod::Stored);
            zip.add_directory(name, options)?;
        }
        EntryKind::File => {
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .large_file(entry.size >= u32::MAX as u64);
            let options = with_permissions(options, &entry.path);
            zip.start_file(name, options)?;
            let mut reader = BufReader::new(File::open(&entry.path).at(&entry.path)?);
            io::copy(&mut reader, zip).at(&entry.path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn with_permissions(options: FileOptions, path: &Path) -> FileOptions {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => options.unix_permissions(meta.permissions().mode() & 0o7777),
        Err(_) => options,
    }
}

#[cfg(not(unix))]
fn with_permissions(options: FileOptions, _path: &Path) -> FileOptions {
    options
}
