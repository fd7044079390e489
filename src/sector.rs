//! Sector address newtypes (spec.md §3): `MainSector` and `SpareSector`
//! distinguish the two address spaces the remap table bridges, mirroring
//! the teacher's `ClusterId`/`SectorNum` split in `fat32/structs.rs` so the
//! type system, not convention, prevents passing a spare offset where a
//! main offset belongs.
//!
//! Construction-string parsing and message dispatch still trade in raw
//! `u64`/`String` at the host boundary; these wrappers apply once a sector
//! number enters the remap table, allocator, or health tracker.

use std::fmt;

macro_rules! sector_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl From<$name> for u64 {
            fn from(v: $name) -> Self {
                v.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

sector_newtype!(MainSector);
sector_newtype!(SpareSector);
