use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Fixed logical sector size used throughout sparemap (spec.md §3).
pub const SECTOR_SIZE: u32 = 512;

/// Wrapper around a block device or image file for sector-based I/O.
///
/// All addressing is in fixed 512-byte sectors; this mirrors the teacher's
/// `Device` (`oetiker-fat32expander/src/device.rs`) but drops the
/// bootstrap/variable-sector-size logic that is specific to parsing a FAT32
/// BPB, since sparemap's sector size is fixed by spec.
pub struct Device {
    file: File,
    path: PathBuf,
    total_sectors: u64,
    #[cfg(feature = "fault-injection")]
    fail_write_sectors: std::sync::RwLock<std::collections::HashSet<u64>>,
    #[cfg(feature = "fault-injection")]
    fail_read_sectors: std::sync::RwLock<std::collections::HashSet<u64>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("total_sectors", &self.total_sectors)
            .finish_non_exhaustive()
    }
}

impl Device {
    fn open_impl<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let path_display = path_buf.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path_buf)
            .map_err(|_| Error::DeviceNotFound(path_display))?;

        let metadata = file.metadata()?;
        let size = if metadata.is_file() {
            metadata.len()
        } else {
            let mut f = file.try_clone()?;
            f.seek(SeekFrom::End(0))?
        };

        Ok(Self {
            file,
            path: path_buf,
            total_sectors: size / SECTOR_SIZE as u64,
            #[cfg(feature = "fault-injection")]
            fail_write_sectors: std::sync::RwLock::new(std::collections::HashSet::new()),
            #[cfg(feature = "fault-injection")]
            fail_read_sectors: std::sync::RwLock::new(std::collections::HashSet::new()),
        })
    }

    /// Fault injection: make writes to `sector` fail until the process
    /// exits, so hot-path error handling can be exercised through the real
    /// device without a real failing disk (spec.md §8 scenario 2).
    /// Build/test with `--features fault-injection`.
    #[cfg(feature = "fault-injection")]
    pub fn inject_write_failure(&self, sector: u64) {
        self.fail_write_sectors.write().unwrap().insert(sector);
    }

    /// Fault injection, read side (spec.md §8 scenario 3).
    #[cfg(feature = "fault-injection")]
    pub fn inject_read_failure(&self, sector: u64) {
        self.fail_read_sectors.write().unwrap().insert(sector);
    }

    /// Open a device or image file for read/write access.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, true)
    }

    /// Open a device in read-only mode.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * SECTOR_SIZE as u64
    }

    /// Reject a request that would read or write past the device's end.
    /// `write_all_at`/`read_exact_at` won't catch this on a regular file: a
    /// `pwrite` past EOF silently extends the file instead of failing, so
    /// this has to be checked explicitly rather than left to the syscall.
    fn check_range(&self, start_sector: u64, count: u64) -> Result<()> {
        let end = start_sector
            .checked_add(count)
            .ok_or(Error::SectorOutOfRange { start_sector, count, total_sectors: self.total_sectors })?;
        if end > self.total_sectors {
            return Err(Error::SectorOutOfRange { start_sector, count, total_sectors: self.total_sectors });
        }
        Ok(())
    }

    /// Read `count` contiguous sectors starting at `start_sector`.
    pub fn read_sectors(&self, start_sector: u64, count: u32) -> Result<Vec<u8>> {
        self.check_range(start_sector, count as u64)?;
        #[cfg(feature = "fault-injection")]
        {
            let failing = self.fail_read_sectors.read().unwrap();
            if (start_sector..start_sector + count as u64).any(|s| failing.contains(&s)) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "injected read failure at sector {}",
                    start_sector
                ))));
            }
        }
        let offset = start_sector * SECTOR_SIZE as u64;
        let size = count as usize * SECTOR_SIZE as usize;
        let mut buffer = vec![0u8; size];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    /// Read a single sector.
    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        self.read_sectors(sector, 1)
    }

    /// Write contiguous sector data starting at `start_sector`. `data.len()`
    /// must be a multiple of `SECTOR_SIZE`.
    pub fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()> {
        let count = (data.len() / SECTOR_SIZE as usize).max(1) as u64;
        self.check_range(start_sector, count)?;
        #[cfg(feature = "fault-injection")]
        {
            let failing = self.fail_write_sectors.read().unwrap();
            if (start_sector..start_sector + count).any(|s| failing.contains(&s)) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "injected write failure at sector {}",
                    start_sector
                ))));
            }
        }
        let offset = start_sector * SECTOR_SIZE as u64;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Write a single sector.
    pub fn write_sector(&self, sector: u64, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE as usize {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "data size {} does not match sector size {}",
                    data.len(),
                    SECTOR_SIZE
                ),
            )));
        }
        self.write_sectors(sector, data)
    }

    /// Flush all writes to stable storage. Used as the fsync-class barrier
    /// invoked between metadata copy writes (spec.md §4.7 write policy) and
    /// after auto-remap inserts a VALID entry (spec.md §4.6 step 4).
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
