//! Filesystem traversal helpers.

pub mod walker;
