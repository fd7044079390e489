//! Live counters and the `status` message line (spec.md §4.8, §6).
//!
//! Grounded on the teacher's `FSInfoReport` (`resize/executor.rs`): a small
//! struct of derived fields plus a `Display` impl producing the exact
//! line format the host-facing status command prints.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counters backing the `status` line and the `metadata_status`
/// message (spec.md §6). All fields use relaxed ordering: they are
/// independent tallies, not a consistency boundary.
#[derive(Default)]
pub struct Stats {
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    total_remaps: AtomicU64,
    total_errors_write: AtomicU64,
    total_errors_read: AtomicU64,
    last_remap_unix: AtomicU64,
    last_error_unix: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_samples: AtomicU64,
    manual_remaps: AtomicU64,
    auto_remaps: AtomicU64,
    scan_progress_permille: AtomicU32,
}

/// `health=<0-100> ...` score (spec.md §6): `100 - min(100, 100 *
/// failed_sectors / main_sectors)`.
pub fn health_score(failed_sectors: u64, main_sectors: u64) -> u8 {
    if main_sectors == 0 {
        return 100;
    }
    let degraded = ((100 * failed_sectors) / main_sectors).min(100);
    (100 - degraded) as u8
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, latency_us: u64) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_us);
    }

    pub fn record_write(&self, latency_us: u64) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_us);
    }

    fn record_latency(&self, latency_us: u64) {
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.total_errors_write.fetch_add(1, Ordering::Relaxed);
        self.last_error_unix.store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.total_errors_read.fetch_add(1, Ordering::Relaxed);
        self.last_error_unix.store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_auto_remap(&self) {
        self.total_remaps.fetch_add(1, Ordering::Relaxed);
        self.auto_remaps.fetch_add(1, Ordering::Relaxed);
        self.last_remap_unix.store(now_unix(), Ordering::Relaxed);
    }

    pub fn record_manual_remap(&self) {
        self.total_remaps.fetch_add(1, Ordering::Relaxed);
        self.manual_remaps.fetch_add(1, Ordering::Relaxed);
        self.last_remap_unix.store(now_unix(), Ordering::Relaxed);
    }

    pub fn set_scan_progress(&self, done: u64, total: u64) {
        let permille = if total == 0 {
            1000
        } else {
            ((done.min(total) * 1000) / total) as u32
        };
        self.scan_progress_permille.store(permille, Ordering::Relaxed);
    }

    /// Reset all counters to zero (spec.md §6 `clear_stats` message). Does
    /// not affect scan progress, which tracks the background scan's actual
    /// position rather than a counter.
    pub fn clear(&self) {
        self.total_reads.store(0, Ordering::Relaxed);
        self.total_writes.store(0, Ordering::Relaxed);
        self.total_remaps.store(0, Ordering::Relaxed);
        self.total_errors_write.store(0, Ordering::Relaxed);
        self.total_errors_read.store(0, Ordering::Relaxed);
        self.manual_remaps.store(0, Ordering::Relaxed);
        self.auto_remaps.store(0, Ordering::Relaxed);
        self.latency_sum_us.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            0
        } else {
            self.latency_sum_us.load(Ordering::Relaxed) / samples
        }
    }

    /// `health_score` is the caller-computed 0-100 value (spec.md §6:
    /// `100 - min(100, 100 * FAILED_sectors / main_sectors)`), since `Stats`
    /// itself does not know the main device's sector count or the health
    /// tracker's failed-sector count.
    pub fn snapshot(&self, health_score: u8) -> StatusLine {
        StatusLine {
            health_score,
            total_errors_write: self.total_errors_write.load(Ordering::Relaxed),
            total_errors_read: self.total_errors_read.load(Ordering::Relaxed),
            auto_remaps: self.auto_remaps.load(Ordering::Relaxed),
            manual_remaps: self.manual_remaps.load(Ordering::Relaxed),
            scan_progress_permille: self.scan_progress_permille.load(Ordering::Relaxed),
        }
    }
}

/// The rendered contents of a `status` message reply (spec.md §6 format:
/// `health=<0-100> errors=W<uint>:R<uint> auto_remaps=<uint>
/// manual_remaps=<uint> scan=<0-100>%`).
pub struct StatusLine {
    pub health_score: u8,
    pub total_errors_write: u64,
    pub total_errors_read: u64,
    pub auto_remaps: u64,
    pub manual_remaps: u64,
    pub scan_progress_permille: u32,
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "health={} errors=W{}:R{} auto_remaps={} manual_remaps={} scan={}%",
            self.health_score,
            self.total_errors_write,
            self.total_errors_read,
            self.auto_remaps,
            self.manual_remaps,
            self.scan_progress_permille / 10,
        )
    }
}
