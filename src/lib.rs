pub mod allocator;
pub mod completion;
pub mod config;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod hotpath;
pub mod metadata;
pub mod remap_table;
pub mod sector;
pub mod stats;
pub mod system;
pub mod target;
pub mod worker;

pub use config::Config;
pub use device::Device;
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use health::{HealthState, HealthTracker, Verdict};
pub use remap_table::{EntryState, RemapEntry, RemapTable};
pub use sector::{MainSector, SpareSector};
pub use stats::{Stats, StatusLine};
pub use system::{check_not_mounted, check_root, get_block_device_size};
pub use target::Target;
