//! Spare-sector allocator (spec.md §4.2).
//!
//! Bumps a watermark across the spare device's usable range, skipping
//! reservation ranges held for metadata copies, and prefers reclaimed
//! free-list entries for locality. Reservations are fixed at construction
//! and never change afterward.

use crate::error::{Error, Result};
use crate::sector::SpareSector;
use std::ops::Range;
use std::sync::Mutex;

/// Half-open ranges on the spare device the allocator must never hand out
/// (spec.md §3 "Spare-sector reservation map").
#[derive(Debug, Clone, Default)]
pub struct ReservationMap {
    ranges: Vec<Range<u64>>,
}

impl ReservationMap {
    pub fn new(mut ranges: Vec<Range<u64>>) -> Self {
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&sector))
    }

    /// The first reserved sector at or after `from`, if any lies within
    /// `[from, end)`. Used by the bump allocator to skip whole reservations
    /// in one step instead of probing sector by sector.
    fn next_reservation_covering(&self, from: u64) -> Option<&Range<u64>> {
        self.ranges.iter().find(|r| r.end > from && r.start <= from)
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }
}

struct AllocatorInner {
    watermark: u64,
    usable_end: u64,
    reservations: ReservationMap,
    free_list: Vec<u64>,
}

/// Spare-sector allocator: contract is `allocate()` / `free()`, never
/// returning a reserved sector, `Exhausted` once the watermark reaches
/// `usable_end` and the free-list is empty (spec.md §4.2).
pub struct Allocator {
    inner: Mutex<AllocatorInner>,
}

impl Allocator {
    /// `usable_end` is the exclusive upper bound of sectors the allocator
    /// may ever hand out (spec.md §3: "usable size of spare (sectors after
    /// reservations)").
    pub fn new(usable_end: u64, reservations: ReservationMap) -> Self {
        let watermark = first_unreserved(0, &reservations);
        Self {
            inner: Mutex::new(AllocatorInner {
                watermark,
                usable_end,
                reservations,
                free_list: Vec::new(),
            }),
        }
    }

    /// Reconstruct allocator state at attach time from a persisted watermark
    /// and a set of sectors known to be in active remap entries, so freed
    /// slots below the watermark are rediscovered (spec.md §4.7 step 4).
    pub fn rebuild(
        usable_end: u64,
        reservations: ReservationMap,
        watermark: u64,
        allocated: &[u64],
    ) -> Self {
        let allocated: std::collections::HashSet<u64> = allocated.iter().copied().collect();
        let mut free_list = Vec::new();
        let mut sector = first_unreserved(0, &reservations);
        while sector < watermark {
            if !allocated.contains(&sector) {
                free_list.push(sector);
            }
            sector = advance(sector, &reservations);
        }
        Self {
            inner: Mutex::new(AllocatorInner {
                watermark,
                usable_end,
                reservations,
                free_list,
            }),
        }
    }

    /// Allocate one spare sector. O(1) amortized (spec.md §4.2).
    pub fn allocate(&self) -> Result<SpareSector> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sector) = inner.free_list.pop() {
            return Ok(SpareSector(sector));
        }
        if inner.watermark >= inner.usable_end {
            return Err(Error::Exhausted);
        }
        let sector = inner.watermark;
        inner.watermark = advance(sector, &inner.reservations);
        Ok(SpareSector(sector))
    }

    /// Return a spare sector to the free-list (e.g. on remap retirement,
    /// spec.md §4.5: "may trigger retirement of that spare sector").
    pub fn free(&self, sector: SpareSector) {
        let mut inner = self.inner.lock().unwrap();
        inner.free_list.push(sector.get());
    }

    pub fn watermark(&self) -> u64 {
        self.inner.lock().unwrap().watermark
    }

    pub fn usable_end(&self) -> u64 {
        self.inner.lock().unwrap().usable_end
    }

    pub fn free_list_len(&self) -> usize {
        self.inner.lock().unwrap().free_list.len()
    }
}

fn first_unreserved(from: u64, reservations: &ReservationMap) -> u64 {
    match reservations.next_reservation_covering(from) {
        Some(r) => r.end,
        None => from,
    }
}

fn advance(sector: u64, reservations: &ReservationMap) -> u64 {
    first_unreserved(sector + 1, reservations)
}
