//! Progress tracking for long-running archive operations.
//!
//! Counts processed files and bytes and produces a snapshot every
//! `interval` files so callers can log throughput.

use std::time::{Duration, Instant};

/// Snapshot emitted at each progress interval
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Number of files processed
    pub files_processed: usize,

    /// Bytes read so far
    pub bytes_processed: u64,

    /// Average speed since start in bytes/second
    pub bytes_per_second: u64,
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    interval: usize,
    files_processed: usize,
    bytes_processed: u64,
}

impl ProgressTracker {
    /// Create a tracker reporting every `interval` files
    pub fn new(interval: usize) -> Self {
        Self {
            start_time: Instant::now(),
            interval: interval.max(1),
            files_processed: 0,
            bytes_processed: 0,
        }
    }

    /// Record one processed file; returns a snapshot when an interval boundary is hit
    pub fn record(&mut self, bytes: u64) -> Option<ProgressSnapshot> {
        self.files_processed += 1;
        self.bytes_processed += bytes;

        if self.files_processed % self.interval == 0 {
            Some(self.snapshot())
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_processed: self.files_processed,
            bytes_processed: self.bytes_processed,
            bytes_per_second: self.average_speed(),
        }
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_processed as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
