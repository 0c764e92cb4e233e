//! Process-level coordination: the run lock and signal handling.

pub mod lock;
pub mod shutdown;
