//! Per-sector health tracking (spec.md §4.3): saturating write/read error
//! counters per main sector, and the quarantine verdict that triggers an
//! auto-remap.
//!
//! Grounded on the teacher's checkpoint/phase state machine discipline in
//! `resize/executor.rs` (an explicit small enum driving a procedure, rather
//! than booleans), applied here to sector health instead of resize phases.
//! The sharded-mutex layout is modeled on the same reasoning the teacher
//! gives for keeping `Device` I/O synchronous and simple: the hot path must
//! not block behind unrelated sectors' updates.

use crate::config::ERROR_COUNTER_CAP;
use std::collections::HashMap;
use std::sync::Mutex;

/// Health state machine for one main sector (spec.md §4.3): HEALTHY ->
/// DEGRADED when either counter crosses `error_threshold`, DEGRADED ->
/// FAILED only once a remap actually completes (or the allocator is
/// exhausted trying); crossing the threshold alone never jumps straight to
/// FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    write_errors: u8,
    read_errors: u8,
    /// Set explicitly once a remap for this sector has completed (or
    /// permanently cannot), never inferred from the counters alone
    /// (spec.md §4.3, §4.6 step 2).
    failed: bool,
}

impl Counters {
    fn bump_write(&mut self) {
        self.write_errors = self.write_errors.saturating_add(1).min(ERROR_COUNTER_CAP);
    }

    fn bump_read(&mut self) {
        self.read_errors = self.read_errors.saturating_add(1).min(ERROR_COUNTER_CAP);
    }

    fn state(&self, threshold: u8) -> HealthState {
        if self.failed {
            HealthState::Failed
        } else if self.write_errors > 0 || self.read_errors > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn quarantined(&self, threshold: u8) -> bool {
        self.write_errors >= threshold || self.read_errors >= threshold
    }
}

/// Number of shards the tracker splits its sector map across, to keep
/// unrelated sectors' counter updates from contending on the same mutex.
const SHARD_COUNT: usize = 16;

/// Sharded, mutex-guarded per-sector error counters with a quarantine
/// verdict (spec.md §4.3).
pub struct HealthTracker {
    shards: Vec<Mutex<HashMap<u64, Counters>>>,
    threshold: u8,
}

/// Outcome of recording an error against a sector, telling the caller
/// whether this sector just crossed into quarantine (spec.md §4.4: "first
/// crossing of the threshold enqueues exactly one remap request").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Degraded,
    /// Crossed the threshold on this call; caller should enqueue a remap.
    QuarantineNow,
    /// Already quarantined by an earlier call; no new remap needed.
    AlreadyQuarantined,
}

impl HealthTracker {
    pub fn new(threshold: u8) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards, threshold }
    }

    fn shard_for(&self, sector: u64) -> &Mutex<HashMap<u64, Counters>> {
        &self.shards[(sector as usize) % SHARD_COUNT]
    }

    /// Record a write error against `sector` and return the resulting
    /// verdict. Callers in `hotpath.rs` pass either a `MainSector` or a
    /// `SpareSector` converted via `.get()`, since the same tracker type
    /// backs both the main-sector health map and the spare-slot health map
    /// used for already-remapped retirement.
    pub fn record_write_error(&self, sector: u64) -> Verdict {
        let mut shard = self.shard_for(sector).lock().unwrap();
        let counters = shard.entry(sector).or_default();
        let was_quarantined = counters.quarantined(self.threshold);
        counters.bump_write();
        self.verdict_after(counters, was_quarantined)
    }

    /// Record a read error against `sector` and return the resulting
    /// verdict.
    pub fn record_read_error(&self, sector: u64) -> Verdict {
        let mut shard = self.shard_for(sector).lock().unwrap();
        let counters = shard.entry(sector).or_default();
        let was_quarantined = counters.quarantined(self.threshold);
        counters.bump_read();
        self.verdict_after(counters, was_quarantined)
    }

    fn verdict_after(&self, counters: &Counters, was_quarantined: bool) -> Verdict {
        if !counters.quarantined(self.threshold) {
            return Verdict::Degraded;
        }
        if was_quarantined {
            Verdict::AlreadyQuarantined
        } else {
            Verdict::QuarantineNow
        }
    }

    /// Mark a sector's health FAILED: called by the worker once a remap
    /// actually completes, or once the allocator reports `Exhausted` while
    /// trying to service it (spec.md §4.3, §4.6 step 2).
    pub fn mark_failed(&self, sector: u64) {
        let mut shard = self.shard_for(sector).lock().unwrap();
        shard.entry(sector).or_default().failed = true;
    }

    pub fn state_of(&self, sector: u64) -> HealthState {
        let shard = self.shard_for(sector).lock().unwrap();
        shard
            .get(&sector)
            .map(|c| c.state(self.threshold))
            .unwrap_or(HealthState::Healthy)
    }

    /// Clear all recorded counters (spec.md §6 `clear_stats` message).
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
    }

    /// Drop a single sector's counters entirely, so a spare-sector number
    /// freed back to the allocator doesn't hand its next tenant a head start
    /// toward quarantine (spec.md §4.5: retirement reallocates the slot,
    /// it doesn't forgive whoever gets it next, but it also shouldn't
    /// inherit the retired tenant's error history).
    pub fn reset(&self, sector: u64) {
        let mut shard = self.shard_for(sector).lock().unwrap();
        shard.remove(&sector);
    }

    /// Total number of sectors with at least one recorded error, across all
    /// shards.
    pub fn tracked_sector_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// Total number of sectors in the terminal FAILED state, used to derive
    /// the numeric health score in the `status` line (spec.md §6).
    pub fn failed_sector_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().values().filter(|c| c.failed).count())
            .sum()
    }
}
