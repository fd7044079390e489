//! Crash-safe metadata engine (spec.md §4.7, §3).
//!
//! K redundant, CRC32-guarded superblock copies are written to reserved
//! ranges on the spare device. Attach-time reassembly reads every copy,
//! keeps the highest `version_counter` among those whose CRC verifies, and
//! repairs any copy that disagrees with the winner.
//!
//! Grounded directly on the teacher's `resize/executor.rs`: the
//! `ResizeCheckpoint` CRC32 + magic + phase-counter pattern is the same
//! shape used here for `Superblock`, and the `maybe_crash_at` fault
//! injection hook (gated on the `fault-injection` feature, driven by an
//! env var naming a crash point) is carried over unchanged in spirit,
//! renamed to this crate's own crash points.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FINGERPRINT_BYTES};
use crate::remap_table::{EntryState, RemapEntry};
use crate::sector::SpareSector;
#[cfg(feature = "fault-injection")]
use std::sync::atomic::{AtomicU64, Ordering};

pub const SUPERBLOCK_MAGIC: &[u8; 8] = b"SPAREMAP";
const HEADER_BYTES: usize = 8 + 8 + 4 + 1 + 1 + 1 + 1 + 4 + FINGERPRINT_BYTES * 2;
const ENTRY_BYTES: usize = 8 + 8 + 1;
const CRC_BYTES: usize = 4;

/// One persisted remap entry (spec.md §4.7: "remap entries" section of the
/// superblock).
fn write_entry(buf: &mut [u8], main_sector: u64, entry: RemapEntry) {
    buf[0..8].copy_from_slice(&main_sector.to_le_bytes());
    buf[8..16].copy_from_slice(&entry.spare_sector.get().to_le_bytes());
    buf[16] = match entry.state {
        EntryState::Rebuilding => 0,
        EntryState::Valid => 1,
    };
}

fn read_entry(buf: &[u8]) -> Result<(u64, RemapEntry)> {
    let main_sector = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let spare_sector = SpareSector(u64::from_le_bytes(buf[8..16].try_into().unwrap()));
    let state = match buf[16] {
        0 => EntryState::Rebuilding,
        1 => EntryState::Valid,
        other => return Err(Error::MetadataCorrupt(other as usize, 0)),
    };
    Ok((main_sector, RemapEntry { spare_sector, state }))
}

/// In-memory form of one superblock copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Superblock {
    pub version_counter: u64,
    pub main_fingerprint: Fingerprint,
    pub spare_fingerprint: Fingerprint,
    pub config: Config,
    pub entries: Vec<(u64, RemapEntry)>,
}

impl Superblock {
    /// Maximum number of remap entries that fit in a copy occupying
    /// `meta_sectors` sectors.
    pub fn capacity(meta_sectors: u32) -> usize {
        let bytes = meta_sectors as usize * crate::device::SECTOR_SIZE as usize;
        bytes.saturating_sub(HEADER_BYTES + CRC_BYTES) / ENTRY_BYTES
    }

    fn encode(&self, meta_sectors: u32) -> Result<Vec<u8>> {
        let capacity = Self::capacity(meta_sectors);
        if self.entries.len() > capacity {
            return Err(Error::MetadataInconsistent(self.version_counter));
        }
        let total = meta_sectors as usize * crate::device::SECTOR_SIZE as usize;
        let mut buf = vec![0u8; total];

        buf[0..8].copy_from_slice(SUPERBLOCK_MAGIC);
        buf[8..16].copy_from_slice(&self.version_counter.to_le_bytes());
        buf[16..20].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[20] = self.config.error_threshold;
        buf[21] = self.config.auto_remap as u8;
        buf[22] = self.config.metadata_copies;
        buf[23] = self.config.debug_level;
        buf[24..28].copy_from_slice(&self.config.fast_path_threshold.to_le_bytes());
        let mut offset = 28;
        self.main_fingerprint.write_to(&mut buf[offset..offset + FINGERPRINT_BYTES]);
        offset += FINGERPRINT_BYTES;
        self.spare_fingerprint.write_to(&mut buf[offset..offset + FINGERPRINT_BYTES]);
        offset += FINGERPRINT_BYTES;
        debug_assert_eq!(offset, HEADER_BYTES);

        for (i, (main_sector, entry)) in self.entries.iter().enumerate() {
            let start = HEADER_BYTES + i * ENTRY_BYTES;
            write_entry(&mut buf[start..start + ENTRY_BYTES], *main_sector, *entry);
        }

        let payload_end = HEADER_BYTES + self.entries.len() * ENTRY_BYTES;
        let crc = crc32fast::hash(&buf[0..payload_end]);
        buf[total - CRC_BYTES..total].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BYTES + CRC_BYTES || &buf[0..8] != SUPERBLOCK_MAGIC {
            return Err(Error::MetadataCorrupt(0, 0));
        }
        let version_counter = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let entry_count = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let config = Config {
            error_threshold: buf[20],
            auto_remap: buf[21] != 0,
            fast_path_threshold: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            debug_level: buf[23],
            metadata_copies: buf[22],
        };
        let mut offset = 28;
        let main_fingerprint = Fingerprint::read_from(&buf[offset..offset + FINGERPRINT_BYTES]);
        offset += FINGERPRINT_BYTES;
        let spare_fingerprint = Fingerprint::read_from(&buf[offset..offset + FINGERPRINT_BYTES]);
        offset += FINGERPRINT_BYTES;
        debug_assert_eq!(offset, HEADER_BYTES);

        let payload_end = HEADER_BYTES + entry_count * ENTRY_BYTES;
        if payload_end + CRC_BYTES > buf.len() {
            return Err(Error::MetadataCorrupt(entry_count, 0));
        }
        let stored_crc = u32::from_le_bytes(buf[buf.len() - CRC_BYTES..].try_into().unwrap());
        let computed_crc = crc32fast::hash(&buf[0..payload_end]);
        if stored_crc != computed_crc {
            return Err(Error::MetadataCorrupt(stored_crc as usize, computed_crc as usize));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let start = HEADER_BYTES + i * ENTRY_BYTES;
            entries.push(read_entry(&buf[start..start + ENTRY_BYTES])?);
        }

        Ok(Self {
            version_counter,
            main_fingerprint,
            spare_fingerprint,
            config,
            entries,
        })
    }
}

/// Where one superblock copy lives on the spare device.
#[derive(Debug, Clone, Copy)]
pub struct CopyLocation {
    pub start_sector: u64,
    pub sector_count: u32,
}

/// Lay out K copies at first/middle/last offsets within the spare device's
/// reserved metadata region, each `meta_sectors` sectors wide (spec.md §9
/// Open Question: K-copy spacing, resolved to first/middle/last).
pub fn plan_copy_locations(copies: u8, meta_sectors: u32, reserved_sectors: u64) -> Vec<CopyLocation> {
    let k = copies as u64;
    let width = meta_sectors as u64;
    if reserved_sectors < width {
        return Vec::new();
    }
    let max_start = reserved_sectors - width;
    (0..k)
        .map(|i| {
            let start_sector = if k <= 1 {
                0
            } else {
                (max_start * i) / (k - 1)
            };
            CopyLocation {
                start_sector,
                sector_count: meta_sectors,
            }
        })
        .collect()
}

/// Total reserved sectors needed to host `copies` copies of `meta_sectors`
/// each, used to build the allocator's `ReservationMap` (spec.md §3).
pub fn reserved_sectors_needed(copies: u8, meta_sectors: u32) -> u64 {
    copies as u64 * meta_sectors as u64
}

#[cfg(feature = "fault-injection")]
static CRASH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fault injection hook for metadata-engine crash testing, mirroring the
/// teacher's `maybe_crash_at` in `resize/executor.rs`. Reads
/// `SPAREMAP_CRASH_AT` once per process and exits immediately when the
/// internal call counter reaches it, simulating power loss mid-write.
#[cfg(feature = "fault-injection")]
fn maybe_crash_at(label: &str) {
    if let Ok(target) = std::env::var("SPAREMAP_CRASH_AT") {
        if let Ok(target) = target.parse::<u64>() {
            let count = CRASH_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
            if count == target {
                log::error!("fault-injection: simulated crash at {} (count={})", label, count);
                std::process::exit(42);
            }
        }
    }
}

#[cfg(not(feature = "fault-injection"))]
fn maybe_crash_at(_label: &str) {}

/// Result of attach-time reassembly: the winning superblock plus how many
/// copies needed repair.
pub struct LoadedMetadata {
    pub superblock: Superblock,
    pub repaired: usize,
}

/// Read every copy, select the highest `version_counter` among those whose
/// CRC verifies, and rewrite any copy whose content does not match the
/// winner (spec.md §4.7 steps 1-3).
pub fn attach(
    spare: &crate::device::Device,
    locations: &[CopyLocation],
) -> Result<LoadedMetadata> {
    let mut candidates: Vec<(usize, Superblock)> = Vec::new();
    for (i, loc) in locations.iter().enumerate() {
        let buf = spare.read_sectors(loc.start_sector, loc.sector_count)?;
        if let Ok(sb) = Superblock::decode(&buf) {
            candidates.push((i, sb));
        }
    }

    if candidates.is_empty() {
        return Err(Error::MetadataInconsistent(0));
    }

    let winner_version = candidates
        .iter()
        .map(|(_, sb)| sb.version_counter)
        .max()
        .unwrap();
    let mut tied = candidates
        .iter()
        .filter(|(_, sb)| sb.version_counter == winner_version)
        .map(|(_, sb)| sb);
    let winner = tied.next().unwrap().clone();
    // spec.md §4.7: two valid copies tying on the highest version_counter
    // must be bitwise equal, or attach must refuse rather than silently
    // picking one arbitrarily.
    for other in tied {
        if *other != winner {
            return Err(Error::MetadataInconsistent(winner_version));
        }
    }

    let stale_or_missing: Vec<usize> = (0..locations.len())
        .filter(|i| {
            candidates
                .iter()
                .find(|(ci, _)| ci == i)
                .map(|(_, sb)| sb.version_counter != winner_version)
                .unwrap_or(true)
        })
        .collect();

    let mut repaired = 0;
    for idx in stale_or_missing {
        let loc = locations[idx];
        if write_copy(spare, loc, &winner).is_ok() {
            repaired += 1;
        }
    }

    Ok(LoadedMetadata {
        superblock: winner,
        repaired,
    })
}

/// Write one superblock copy to its reserved location, syncing afterward so
/// the write is durable before the caller proceeds (spec.md §4.7 write
/// policy: "each copy write is followed by a barrier").
pub fn write_copy(
    spare: &crate::device::Device,
    location: CopyLocation,
    superblock: &Superblock,
) -> Result<()> {
    maybe_crash_at("before-encode");
    let buf = superblock.encode(location.sector_count)?;
    maybe_crash_at("before-write");
    spare.write_sectors(location.start_sector, &buf)?;
    maybe_crash_at("before-sync");
    spare.sync()?;
    Ok(())
}

/// Write all K copies with a strictly increasing `version_counter`,
/// returning the number that succeeded. The caller only needs a majority to
/// survive a crash; a single in-flight failure does not abort the others
/// (spec.md §4.7: independent per-copy writes).
pub fn write_all(
    spare: &crate::device::Device,
    locations: &[CopyLocation],
    superblock: &Superblock,
) -> Result<usize> {
    let mut ok = 0;
    for loc in locations {
        if write_copy(spare, *loc, superblock).is_ok() {
            ok += 1;
        }
    }
    if ok == 0 {
        return Err(Error::MetadataInconsistent(superblock.version_counter));
    }
    Ok(ok)
}

/// Read-only health check for the `metadata_status` message (spec.md §6):
/// how many copies currently decode and agree with the winning version,
/// out of how many total, without repairing anything.
pub fn check(spare: &crate::device::Device, locations: &[CopyLocation]) -> (u64, usize, usize) {
    let mut versions = Vec::new();
    for loc in locations {
        if let Ok(buf) = spare.read_sectors(loc.start_sector, loc.sector_count) {
            if let Ok(sb) = Superblock::decode(&buf) {
                versions.push(sb.version_counter);
            }
        }
    }
    let winner = versions.iter().copied().max().unwrap_or(0);
    let agreeing = versions.iter().filter(|&&v| v == winner).count();
    (winner, agreeing, locations.len())
}
