//! Platform-specific durable sync for segment files and the WAL directory
//!
//! Each platform has different guarantees for when data is actually written to persistent storage.
//! `durable_sync` maps to the strongest durability guarantee available on each platform;
//! `sync_dir` makes file creation, rename and deletion inside the WAL directory durable.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{WalError, WalResult};

/// Ensures segment data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the disk cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// The writer thread is the only caller for open segments; it holds no lock
/// that producers wait on while this blocks.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync on Apple platforms only reaches the drive's volatile cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Make directory entry changes (segment create, rename, unlink) durable.
///
/// Directories cannot be opened for sync on Windows; there the call is a no-op.
pub fn sync_dir(dir: &Path) -> WalResult<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)
            .map_err(WalError::io_at(dir, "Failed to open WAL directory for sync"))?;
        handle
            .sync_all()
            .map_err(WalError::io_at(dir, "Failed to sync WAL directory"))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
