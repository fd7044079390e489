//! Device fingerprints (spec.md §3, §4.7): a compact identity record for the
//! main and spare devices, stored in the superblock and checked at attach
//! time so metadata is never reassembled against the wrong device.
//!
//! Grounded on the teacher's boot-sector field layout discipline
//! (`oetiker-fat32expander/src/fat32/structs.rs`): fixed-width little-endian
//! fields read and written at explicit byte offsets.

use crate::device::{Device, SECTOR_SIZE};
use crate::system::identifier_hash;

/// On-disk size of a serialized `Fingerprint` (fixed-width).
pub const FINGERPRINT_BYTES: usize = 16;

/// Identity of one underlying device, as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size_sectors: u64,
    pub logical_block_size: u32,
    pub identifier_hash: u32,
}

impl Fingerprint {
    /// Compute the fingerprint of an already-opened device.
    pub fn of(device: &Device) -> Self {
        Self {
            size_sectors: device.total_sectors(),
            logical_block_size: SECTOR_SIZE,
            identifier_hash: identifier_hash(device.path()),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.size_sectors.to_le_bytes());
        buf[8..12].copy_from_slice(&self.logical_block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.identifier_hash.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            size_sectors: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            logical_block_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            identifier_hash: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    /// Whether this fingerprint matches the device as currently opened.
    /// Note: `identifier_hash` is path-derived and intentionally excluded
    /// from the liveness check here; callers compare it explicitly where a
    /// stricter identity match is required (see `Target::construct`, which
    /// requires full fingerprint equality against the persisted superblock).
    pub fn matches_size(&self, device: &Device) -> bool {
        self.size_sectors == device.total_sectors()
            && self.logical_block_size == SECTOR_SIZE
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{size_sectors={}, block_size={}, id={:#010x}}}",
            self.size_sectors, self.logical_block_size, self.identifier_hash
        )
    }
}
