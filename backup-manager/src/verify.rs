//! Post-creation sanity checks on backup artifacts.

use crate::archive::compression::{read_head, Compression};
use crate::utils::errors::{BackupError, IoResultExt, Result};
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Bytes decoded from a compressed dump to prove it is readable.
const FIRST_BLOCK: usize = 64 * 1024;

/// Bytes of a plain dump inspected for header tokens.
const HEADER_WINDOW: usize = 1024;

const DUMP_MARKERS: &[&str] = &[
    "-- MySQL dump",
    "-- MariaDB dump",
    "CREATE TABLE",
    "INSERT INTO",
    "SET NAMES",
    "/*!40",
];

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Check a dump artifact; the codec is taken from its extension.
    pub fn verify_database(path: &Path) -> Result<()> {
        let codec = Compression::from_path(path);
        if codec.is_enabled() {
            let block = read_head(path, codec, FIRST_BLOCK).map_err(|e| {
                BackupError::Integrity(format!("{} cannot be decompressed: {}", path.display(), e))
            })?;
            if block.is_empty() {
                return Err(BackupError::Integrity(format!(
                    "{} decompresses to nothing",
                    path.display()
                )));
            }
            debug!("Decoded {} bytes from {}", block.len(), path.display());
            return Ok(());
        }

        let head = read_head(path, Compression::None, HEADER_WINDOW)?;
        let text = String::from_utf8_lossy(&head);
        if DUMP_MARKERS.iter().any(|m| text.contains(m)) {
            Ok(())
        } else {
            Err(BackupError::Integrity(format!(
                "{} does not look like a SQL dump",
                path.display()
            )))
        }
    }

    /// Check that a zip archive lists cleanly and is not empty.
    pub fn verify_archive(path: &Path) -> Result<usize> {
        let file = File::open(path).at(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| {
            BackupError::Integrity(format!("{} is not a readable archive: {}", path.display(), e))
        })?;

        let entries = archive.len();
        for i in 0..entries {
            archive.by_index(i).map_err(|e| {
                BackupError::Integrity(format!("{} entry {} is corrupt: {}", path.display(), i, e))
            })?;
        }

        if entries == 0 {
            return Err(BackupError::Integrity(format!(
                "{} contains no entries",
                path.display()
            )));
        }
        Ok(entries)
    }
}
