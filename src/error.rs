use thiserror::Error;

/// All errors that can occur while constructing, operating on, or tearing
/// down a sparemap target.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid target construction arguments: {0}")]
    Construction(String),

    #[error("device '{0}' not found or cannot be opened")]
    DeviceNotFound(String),

    #[error("device '{0}' is currently mounted at '{1}'")]
    DeviceMounted(String, String),

    #[error("main device and spare device resolve to the same identifier")]
    DuplicateDevice,

    #[error(
        "spare device too small: {spare_sectors} sectors available, need at least {minimum} \
         ({main_sectors} main sectors x 5% plus metadata overhead)"
    )]
    SpareTooSmall {
        spare_sectors: u64,
        minimum: u64,
        main_sectors: u64,
    },

    #[error(
        "device fingerprint mismatch: metadata expects {expected}, opened device reports {actual}"
    )]
    DeviceMismatch { expected: String, actual: String },

    #[error("metadata is corrupt: {0} of {1} superblock copies are valid (need at least 1)")]
    MetadataCorrupt(usize, usize),

    #[error(
        "two superblock copies share the highest version counter ({0}) but are not bitwise equal"
    )]
    MetadataInconsistent(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "sector range {start_sector}..{} is out of bounds for a {total_sectors}-sector device",
        start_sector + count
    )]
    SectorOutOfRange {
        start_sector: u64,
        count: u64,
        total_sectors: u64,
    },

    #[error("spare-sector allocator exhausted")]
    Exhausted,

    #[error("hot-path completion pool exhausted, try again")]
    ResourceBusy,

    #[error("target is shutting down, submission refused")]
    ShuttingDown,

    #[error("main sector {0} is already mapped")]
    AlreadyMapped(u64),

    #[error("remap table storage cannot grow beyond its bucket cap")]
    OutOfSpace,

    #[error("no such mapping for main sector {0}")]
    NotMapped(u64),

    #[error("unknown configuration option '{0}'")]
    UnknownOption(String),

    #[error("invalid value '{value}' for configuration option '{key}': {reason}")]
    InvalidOptionValue {
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
