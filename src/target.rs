//! Target lifecycle (spec.md §4.7, §6): construction-string parsing,
//! attach-time metadata reassembly, the `status`/message surface, and
//! teardown.
//!
//! Grounded on the teacher's `main.rs` command dispatch (clap subcommands
//! each calling into a focused function) and on `resize/executor.rs`'s
//! `get_fs_info`/`FSInfoReport` pair for the status/report split used here
//! by `status_line` and `metadata_status`.

use crate::allocator::{Allocator, ReservationMap};
use crate::completion::ContextPool;
use crate::config::Config;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::health::HealthTracker;
use crate::hotpath::HotPath;
use crate::metadata::{self, CopyLocation, Superblock};
use crate::remap_table::{EntryState, RemapEntry, RemapTable};
use crate::sector::MainSector;
use crate::stats::{self, Stats};
use crate::system;
use crate::worker::{self, MetadataPersister, WorkerHandle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Default width, in sectors, of one superblock copy when the construction
/// string does not specify `spare_meta_sectors` (spec.md §6).
pub const DEFAULT_META_SECTORS: u32 = 8;

/// Bound on the auto-remap worker's request queue (spec.md §4.6).
const WORKER_QUEUE_CAPACITY: usize = 256;

/// Bound on concurrently in-flight hot-path requests (spec.md §4.4).
const CONTEXT_POOL_CAPACITY: usize = 128;

struct SuperblockPersister {
    spare: Arc<Device>,
    locations: Vec<CopyLocation>,
    config: Config,
    main_fingerprint: Fingerprint,
    spare_fingerprint: Fingerprint,
    version_counter: AtomicU64,
}

impl MetadataPersister for SuperblockPersister {
    fn persist(&self, entries: &[(u64, RemapEntry)]) -> Result<()> {
        let version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let superblock = Superblock {
            version_counter: version,
            main_fingerprint: self.main_fingerprint,
            spare_fingerprint: self.spare_fingerprint,
            config: self.config.clone(),
            entries: entries.to_vec(),
        };
        metadata::write_all(&self.spare, &self.locations, &superblock)?;
        Ok(())
    }
}

/// An attached sparemap target: the full set of live components wired
/// together, ready to service I/O through `hot_path()` and administrative
/// messages through `message()`.
pub struct Target {
    main: Arc<Device>,
    spare: Arc<Device>,
    table: Arc<RemapTable>,
    allocator: Arc<Allocator>,
    health: Arc<HealthTracker>,
    /// Error counters for spare sectors already holding a migrated main
    /// sector, distinct from `health` (spec.md §4.5 retirement path).
    spare_health: Arc<HealthTracker>,
    stats: Arc<Stats>,
    worker: WorkerHandle,
    persister: Arc<dyn MetadataPersister>,
    context_pool: ContextPool,
    copy_locations: Vec<CopyLocation>,
    auto_remap: AtomicBool,
}

/// Parse a construction string's whitespace-separated arguments:
/// `<main_dev> <spare_dev> [spare_meta_sectors] [key=value ...]`
/// (spec.md §6).
struct ParsedArgs {
    main_path: String,
    spare_path: String,
    meta_sectors: u32,
    options: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<ParsedArgs> {
    if args.len() < 2 {
        return Err(Error::Construction(
            "expected at least <main_dev> <spare_dev>".to_string(),
        ));
    }
    let main_path = args[0].clone();
    let spare_path = args[1].clone();
    let mut rest = &args[2..];
    let meta_sectors = if let Some(first) = rest.first() {
        match first.parse::<u32>() {
            Ok(n) if n > 0 => {
                rest = &rest[1..];
                n
            }
            _ => DEFAULT_META_SECTORS,
        }
    } else {
        DEFAULT_META_SECTORS
    };
    Ok(ParsedArgs {
        main_path,
        spare_path,
        meta_sectors,
        options: rest.to_vec(),
    })
}

impl Target {
    /// Construct (attach) a target from a dm-style construction string's
    /// arguments (spec.md §4.7, §6).
    pub fn construct(args: &[String]) -> Result<Self> {
        let parsed = parse_args(args)?;

        for path in [&parsed.main_path, &parsed.spare_path] {
            if !system::is_usable_device(path) {
                return Err(Error::Construction(format!(
                    "{} is not a usable block device or file",
                    path
                )));
            }
        }
        if parsed.main_path == parsed.spare_path {
            return Err(Error::DuplicateDevice);
        }

        let config = Config::parse(&parsed.options)?;

        let main = Arc::new(Device::open(&parsed.main_path)?);
        let spare = Arc::new(Device::open(&parsed.spare_path)?);

        let reserved_sectors =
            metadata::reserved_sectors_needed(config.metadata_copies, parsed.meta_sectors);
        if spare.total_sectors() <= reserved_sectors {
            return Err(Error::SpareTooSmall {
                spare_sectors: spare.total_sectors(),
                minimum: reserved_sectors + 1,
                main_sectors: main.total_sectors(),
            });
        }

        let copy_locations = metadata::plan_copy_locations(
            config.metadata_copies,
            parsed.meta_sectors,
            reserved_sectors,
        );
        let reservations = ReservationMap::new(
            copy_locations
                .iter()
                .map(|loc| loc.start_sector..(loc.start_sector + loc.sector_count as u64))
                .collect(),
        );

        let main_fingerprint = Fingerprint::of(&main);
        let spare_fingerprint = Fingerprint::of(&spare);

        let (entries, starting_version) = match metadata::attach(&spare, &copy_locations) {
            Ok(loaded) => {
                if loaded.superblock.main_fingerprint != main_fingerprint {
                    return Err(Error::DeviceMismatch {
                        expected: loaded.superblock.main_fingerprint.to_string(),
                        actual: main_fingerprint.to_string(),
                    });
                }
                if loaded.superblock.spare_fingerprint != spare_fingerprint {
                    return Err(Error::DeviceMismatch {
                        expected: loaded.superblock.spare_fingerprint.to_string(),
                        actual: spare_fingerprint.to_string(),
                    });
                }
                (loaded.superblock.entries, loaded.superblock.version_counter)
            }
            Err(_) => (Vec::new(), 0),
        };

        let watermark = entries
            .iter()
            .map(|(_, e)| e.spare_sector.get() + 1)
            .max()
            .unwrap_or(0);
        let allocated: Vec<u64> = entries.iter().map(|(_, e)| e.spare_sector.get()).collect();
        let allocator = Arc::new(Allocator::rebuild(
            spare.total_sectors(),
            reservations,
            watermark.max(reserved_sectors),
            &allocated,
        ));

        let table = Arc::new(RemapTable::from_entries(entries));
        let health = Arc::new(HealthTracker::new(config.error_threshold));
        let spare_health = Arc::new(HealthTracker::new(config.error_threshold));
        let stats = Arc::new(Stats::new());

        let persister: Arc<dyn MetadataPersister> = Arc::new(SuperblockPersister {
            spare: spare.clone(),
            locations: copy_locations.clone(),
            config: config.clone(),
            main_fingerprint,
            spare_fingerprint,
            version_counter: AtomicU64::new(starting_version),
        });

        let worker = worker::spawn(
            main.clone(),
            spare.clone(),
            table.clone(),
            allocator.clone(),
            health.clone(),
            spare_health.clone(),
            stats.clone(),
            persister.clone(),
            WORKER_QUEUE_CAPACITY,
        );

        Ok(Self {
            main,
            spare,
            table,
            allocator,
            health,
            spare_health,
            stats,
            worker,
            persister,
            context_pool: ContextPool::new(CONTEXT_POOL_CAPACITY),
            copy_locations,
            auto_remap: AtomicBool::new(config.auto_remap),
        })
    }

    /// Borrow a `HotPath` view for servicing one I/O request.
    pub fn hot_path(&self) -> HotPath<'_> {
        HotPath {
            main: &self.main,
            spare: &self.spare,
            table: &self.table,
            allocator: &self.allocator,
            health: &self.health,
            spare_health: &self.spare_health,
            stats: &self.stats,
            worker: &self.worker,
            persister: self.persister.as_ref(),
            context_pool: &self.context_pool,
            auto_remap: self.auto_remap.load(Ordering::Relaxed),
        }
    }

    /// Render the `status` message reply (spec.md §6).
    pub fn status_line(&self) -> String {
        let failed = self.health.failed_sector_count() as u64;
        let score = stats::health_score(failed, self.main.total_sectors());
        self.stats.snapshot(score).to_string()
    }

    /// Dispatch an administrative message (spec.md §6): `remap`,
    /// `clear_stats`, `metadata_status`, `set_auto_remap`.
    pub fn message(&self, command: &str, args: &[String]) -> Result<String> {
        match command {
            "remap" => {
                let sector: u64 = args
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::Construction("remap requires a sector number".into()))?;
                self.manual_remap(sector)?;
                Ok(format!("remapped {}", sector))
            }
            "clear_stats" => {
                self.stats.clear();
                self.health.clear();
                Ok("stats cleared".to_string())
            }
            "metadata_status" => {
                let (version, ok, total) = metadata::check(&self.spare, &self.copy_locations);
                Ok(format!("version={} copies_ok={}/{}", version, ok, total))
            }
            "set_auto_remap" => {
                let enabled = args.first().map(|s| s == "1" || s == "true").unwrap_or(false);
                self.auto_remap.store(enabled, Ordering::Relaxed);
                Ok(format!("auto_remap={}", enabled))
            }
            other => Err(Error::Construction(format!("unknown message {}", other))),
        }
    }

    /// Directly remap a main sector on administrator request, bypassing
    /// the quarantine threshold (spec.md §6 `remap` message).
    fn manual_remap(&self, main_sector: u64) -> Result<()> {
        let main_sector = MainSector(main_sector);
        if let Some(existing) = self.table.lookup(main_sector) {
            if existing.state == EntryState::Valid {
                return Err(Error::AlreadyMapped(main_sector.get()));
            }
        }
        let spare_sector = self.allocator.allocate()?;
        let payload = self
            .main
            .read_sector(main_sector.get())
            .unwrap_or_else(|_| vec![0u8; crate::device::SECTOR_SIZE as usize]);

        self.table.reassign(
            main_sector,
            RemapEntry {
                spare_sector,
                state: EntryState::Rebuilding,
            },
        )?;
        self.spare.write_sector(spare_sector.get(), &payload)?;
        self.spare.sync()?;
        self.table.mark_valid(main_sector);
        self.persister.persist(&self.table.snapshot())?;
        self.stats.record_manual_remap();
        Ok(())
    }

    /// Quiesce the target: flush both devices and stop the worker
    /// (spec.md §4.7 teardown: "quiesce/flush/persist").
    pub fn teardown(self) -> Result<()> {
        self.main.sync()?;
        self.spare.sync()?;
        self.worker.shutdown();
        Ok(())
    }

    pub fn main_path(&self) -> &Path {
        self.main.path()
    }

    pub fn spare_path(&self) -> &Path {
        self.spare.path()
    }

    /// Escape hatch to the raw main device, for fault injection tests
    /// (spec.md §8 scenarios 2 and 3). Build/test with
    /// `--features fault-injection`.
    #[cfg(feature = "fault-injection")]
    pub fn main_device(&self) -> &Device {
        &self.main
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_backing(sectors: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; (sectors * 512) as usize]).unwrap();
        file
    }

    #[test]
    fn test_construct_and_status() {
        let main = make_backing(256);
        let spare = make_backing(256);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            spare.path().to_string_lossy().to_string(),
            "4".to_string(),
        ];
        let target = Target::construct(&args).unwrap();
        let status = target.status_line();
        assert!(status.starts_with("health=100"));
        target.teardown().unwrap();
    }

    #[test]
    fn test_construct_rejects_duplicate_device() {
        let main = make_backing(256);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            main.path().to_string_lossy().to_string(),
        ];
        assert!(matches!(Target::construct(&args), Err(Error::DuplicateDevice)));
    }

    #[test]
    fn test_construct_rejects_spare_too_small() {
        let main = make_backing(256);
        let spare = make_backing(4);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            spare.path().to_string_lossy().to_string(),
            "4".to_string(),
            "metadata_copies=3".to_string(),
        ];
        assert!(matches!(
            Target::construct(&args),
            Err(Error::SpareTooSmall { .. })
        ));
    }

    #[test]
    fn test_manual_remap_message_and_metadata_status() {
        let main = make_backing(256);
        let spare = make_backing(256);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            spare.path().to_string_lossy().to_string(),
            "4".to_string(),
        ];
        let target = Target::construct(&args).unwrap();
        target.message("remap", &["10".to_string()]).unwrap();
        assert!(target.hot_path().is_remapped(10));

        let status = target.message("metadata_status", &[]).unwrap();
        assert!(status.starts_with("version="));
        target.teardown().unwrap();
    }

    #[test]
    fn test_reattach_recovers_remap_table() {
        let main = make_backing(256);
        let spare = make_backing(256);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            spare.path().to_string_lossy().to_string(),
            "4".to_string(),
        ];
        {
            let target = Target::construct(&args).unwrap();
            target.message("remap", &["20".to_string()]).unwrap();
            target.teardown().unwrap();
        }
        let reattached = Target::construct(&args).unwrap();
        assert!(reattached.hot_path().is_remapped(20));
        reattached.teardown().unwrap();
    }

    #[test]
    fn test_clear_stats_message() {
        let main = make_backing(256);
        let spare = make_backing(256);
        let args = vec![
            main.path().to_string_lossy().to_string(),
            spare.path().to_string_lossy().to_string(),
            "4".to_string(),
        ];
        let target = Target::construct(&args).unwrap();
        target.message("remap", &["1".to_string()]).unwrap();
        target.message("clear_stats", &[]).unwrap();
        let status = target.status_line();
        assert!(status.contains("manual_remaps=0"));
        target.teardown().unwrap();
    }
}
