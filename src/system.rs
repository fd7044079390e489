//! Host system glue: root check, mount check, raw device size, and a
//! stable per-device identifier hash used by the fingerprint (§3).
//!
//! Grounded directly on the teacher's `system.rs`
//! (`oetiker-fat32expander/src/system.rs`), which performs the same
//! `/proc/mounts` scan and `geteuid()` check for the same reason: refuse to
//! operate on a device the kernel already has mounted, and warn when not
//! running with the privilege block devices require.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Check if a device is currently mounted, by scanning `/proc/mounts`.
pub fn check_not_mounted(device_path: impl AsRef<Path>) -> Result<()> {
    let device_path = resolve_device_path(device_path.as_ref())?;

    let mounts = fs::read_to_string("/proc/mounts").map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "failed to read /proc/mounts: {}",
            e
        )))
    })?;

    for line in mounts.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            let mount_device = parts[0];
            let mount_point = parts[1];

            if let Ok(resolved_mount) = resolve_device_path(Path::new(mount_device)) {
                if resolved_mount == device_path {
                    return Err(Error::DeviceMounted(device_path, mount_point.to_string()));
                }
            }
        }
    }

    Ok(())
}

/// Resolve a device path to its canonical form (follows symlinks such as
/// `/dev/disk/by-uuid/...`).
fn resolve_device_path(path: &Path) -> Result<String> {
    match path.canonicalize() {
        Ok(canonical) => Ok(canonical.to_string_lossy().to_string()),
        Err(_) => Ok(path.to_string_lossy().to_string()),
    }
}

/// Check if running as root (required for raw block device access).
pub fn check_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get the size of a block device in bytes.
#[cfg(target_os = "linux")]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let path = path.as_ref();
    let file = File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
    let fd = file.as_raw_fd();

    let mut size: u64 = 0;
    // BLKGETSIZE64 = 0x80081272
    #[allow(overflowing_literals)]
    const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

    let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };

    if result == -1 {
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(size)
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    let path = path.as_ref();
    let mut file = File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
    let size = file.seek(SeekFrom::End(0))?;
    Ok(size)
}

/// Check whether a path refers to a block device (or, for testing, a
/// regular file we treat as an image-backed device). The target
/// construction parser (§6) rejects paths that are neither.
pub fn is_usable_device(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match fs::metadata(path) {
        Ok(meta) => {
            use std::os::unix::fs::FileTypeExt;
            meta.file_type().is_block_device() || meta.is_file()
        }
        Err(_) => false,
    }
}

/// Stable 32-bit hash of a device identifier (its canonicalized path),
/// stored in the fingerprint record (§3) so attach-time reassembly can
/// detect that metadata was written against a different device.
pub fn identifier_hash(path: impl AsRef<Path>) -> u32 {
    let resolved = resolve_device_path(path.as_ref()).unwrap_or_default();
    crc32fast::hash(resolved.as_bytes())
}
