//! Artifact encoding: dump compression and the upload tree archive.

pub mod compression;
pub mod files;
