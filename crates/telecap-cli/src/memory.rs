//! Memory auto-stop guard.
//!
//! The image queue is unbounded, so memory is bounded here instead: RSS is
//! sampled every N record ticks and a crossing turns into a graceful
//! end-of-session, preserving every already-queued episode instead of dying
//! to the OOM killer.

use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
/// Linux base page size; huge pages do not show up in statm resident counts.
const PAGE_BYTES: u64 = 4096;

/// Resident set size from `/proc/self/statm`, in bytes.
pub fn process_rss_bytes() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = text.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_BYTES)
}

pub fn process_rss_gb() -> f64 {
    process_rss_bytes().unwrap_or(0) as f64 / BYTES_PER_GB
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryExceeded {
    pub current_gb: f64,
    pub limit_gb: f64,
}

#[derive(Debug)]
pub struct MemoryGuard {
    limit_gb: f64,
    check_interval_ticks: u64,
    ticks: u64,
}

impl MemoryGuard {
    pub fn new(limit_gb: f64, check_interval_ticks: u64) -> Self {
        Self {
            limit_gb,
            check_interval_ticks: check_interval_ticks.max(1),
            ticks: 0,
        }
    }

    /// Called once per record tick; samples RSS every interval and reports
    /// a crossing at most one guard period after it happened.
    pub fn on_tick(&mut self) -> Option<MemoryExceeded> {
        self.ticks += 1;
        if self.ticks % self.check_interval_ticks != 0 {
            return None;
        }
        let current_gb = process_rss_gb();
        if current_gb >= self.limit_gb {
            warn!(
                current_gb = format!("{current_gb:.2}"),
                limit_gb = format!("{:.1}", self.limit_gb),
                "memory limit reached, auto-stopping recording"
            );
            return Some(MemoryExceeded {
                current_gb,
                limit_gb: self.limit_gb,
            });
        }
        None
    }
}
