//! Completion-context pool and fan-out combinator (spec.md §4.4, §4.6).
//!
//! A multi-sector request is split into per-sector segments on the hot
//! path (`hotpath.rs`); each segment's completion must be folded back into
//! one verdict for the original request without the hot path blocking on
//! unrelated segments. This module provides that fold, plus the fixed-size
//! preallocated pool of contexts the hot path draws from, mirroring the
//! teacher's insistence on fixed-size, crash-safe state
//! (`resize/executor.rs`'s `ResizeCheckpoint`) applied here to an in-memory
//! structure instead of an on-disk one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Lifecycle of one completion context (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Segment submitted to its target device, awaiting result.
    Submitted,
    /// All segments have reported in; aggregate verdict is being computed.
    Inspect,
    /// Verdict delivered to the caller; context returned to the pool.
    Release,
}

/// Shared state for one in-flight request split across `total` segments.
/// `first_failing_sector` records the first segment that failed, for health
/// tracking and error reporting (spec.md §4.4: "first failure wins").
pub struct FanoutContext {
    outstanding: AtomicUsize,
    failed: AtomicBool,
    first_failing_sector: Mutex<Option<u64>>,
    phase: Mutex<Phase>,
}

impl FanoutContext {
    pub fn new(total: usize) -> Self {
        Self {
            outstanding: AtomicUsize::new(total),
            failed: AtomicBool::new(false),
            first_failing_sector: Mutex::new(None),
            phase: Mutex::new(Phase::Submitted),
        }
    }

    /// Record one segment's completion. Returns `true` once every segment
    /// has reported, at which point the caller should call `finish()`.
    pub fn complete_segment(&self, sector: u64, ok: bool) -> bool {
        if !ok {
            self.failed.store(true, Ordering::SeqCst);
            let mut first = self.first_failing_sector.lock().unwrap();
            if first.is_none() {
                *first = Some(sector);
            }
        }
        let remaining = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            *self.phase.lock().unwrap() = Phase::Inspect;
            true
        } else {
            false
        }
    }

    /// Finalize the request: returns `Ok(())` if every segment succeeded,
    /// or the first failing sector otherwise. Transitions to `Release`.
    pub fn finish(&self) -> std::result::Result<(), u64> {
        let result = if self.failed.load(Ordering::SeqCst) {
            Err(self.first_failing_sector.lock().unwrap().unwrap_or(0))
        } else {
            Ok(())
        };
        *self.phase.lock().unwrap() = Phase::Release;
        result
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }
}

/// Fixed-size pool of context slots. The hot path must never allocate
/// unboundedly under load; once every slot is in use a new request returns
/// `ResourceBusy` rather than growing the pool (spec.md §4.4).
pub struct ContextPool {
    slots: Vec<Mutex<bool>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(false));
        }
        Self { slots }
    }

    /// Acquire a free slot index, or `ResourceBusy` if the pool is
    /// saturated.
    pub fn acquire(&self) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().unwrap();
            if !*guard {
                *guard = true;
                return Ok(i);
            }
        }
        Err(Error::ResourceBusy)
    }

    pub fn release(&self, index: usize) {
        *self.slots[index].lock().unwrap() = false;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| *s.lock().unwrap()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_all_succeed() {
        let ctx = FanoutContext::new(3);
        assert!(!ctx.complete_segment(0, true));
        assert!(!ctx.complete_segment(1, true));
        assert!(ctx.complete_segment(2, true));
        assert_eq!(ctx.phase(), Phase::Inspect);
        assert_eq!(ctx.finish(), Ok(()));
        assert_eq!(ctx.phase(), Phase::Release);
    }

    #[test]
    fn test_fanout_records_first_failure() {
        let ctx = FanoutContext::new(3);
        ctx.complete_segment(10, true);
        ctx.complete_segment(11, false);
        ctx.complete_segment(12, false);
        assert_eq!(ctx.finish(), Err(11));
    }

    #[test]
    fn test_pool_exhaustion_returns_resource_busy() {
        let pool = ContextPool::new(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::ResourceBusy)));
        pool.release(a);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_pool_in_use_count() {
        let pool = ContextPool::new(4);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.capacity(), 4);
    }
}
