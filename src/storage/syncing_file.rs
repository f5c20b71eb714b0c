//! Append-optimised file wrapper with periodic range syncs.
//!
//! A [`SyncingFile`] amortises durability cost over many small appends:
//! every `bytes_per_sync` written bytes it schedules a range sync of the
//! prefix up to that boundary and advances an atomically readable
//! `sync_offset` watermark. The watermark trails a 1 MiB buffer of recently
//! written bytes (aligned down to 4 KiB) so the kernel is never asked to
//! flush pages the writer is still likely to touch.

use crate::error::Result;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Recently written bytes excluded from range syncs.
const SYNC_RANGE_BUFFER: u64 = 1 << 20;

/// Range-sync targets are aligned down to this boundary.
const SYNC_RANGE_ALIGNMENT: u64 = 4 << 10;

/// Configuration for a [`SyncingFile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncingFileOptions {
    /// Schedule a range sync every this many written bytes; 0 disables.
    pub bytes_per_sync: u64,
    /// Preallocate space ahead of the write offset in steps of this size;
    /// 0 disables.
    pub preallocate_size: u64,
}

/// A writable file that issues range syncs as bytes accumulate and tracks
/// how far the contents are known durable.
pub struct SyncingFile {
    file: File,
    bytes_per_sync: u64,
    preallocate_size: u64,
    offset: AtomicU64,
    sync_offset: AtomicU64,
    preallocated_blocks: AtomicU64,
}

impl SyncingFile {
    /// Wrap `file`, treating `start_offset` as the current logical length
    /// (bytes already present before this wrapper took over appends).
    pub fn new(file: File, options: SyncingFileOptions, start_offset: u64) -> Self {
        Self {
            file,
            bytes_per_sync: options.bytes_per_sync,
            preallocate_size: options.preallocate_size,
            offset: AtomicU64::new(start_offset),
            sync_offset: AtomicU64::new(0),
            preallocated_blocks: AtomicU64::new(0),
        }
    }

    /// Append `buf` at the current offset. Callers serialise writes; the
    /// offset bookkeeping is atomic only so readers can snapshot it.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        (&self.file).write_all(buf)?;
        let offset = self.offset.fetch_add(buf.len() as u64, Ordering::SeqCst) + buf.len() as u64;
        self.maybe_preallocate(offset)?;
        self.maybe_sync(offset)?;
        Ok(buf.len())
    }

    /// Current logical length in bytes.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Watermark below which contents are known durable. Monotonically
    /// non-decreasing across appends.
    pub fn sync_offset(&self) -> u64 {
        self.sync_offset.load(Ordering::SeqCst)
    }

    /// Full durability barrier.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        self.ratchet_sync_offset(self.offset());
        Ok(())
    }

    /// Final sync, then close the underlying descriptor.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        Ok(())
    }

    /// Shrink the file to `len` bytes. Rollback path only; the watermark is
    /// clamped so it never points past the new end.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.offset.store(len, Ordering::SeqCst);
        self.sync_offset.fetch_min(len, Ordering::SeqCst);
        self.file.sync_data()?;
        Ok(())
    }

    fn maybe_sync(&self, offset: u64) -> Result<()> {
        if self.bytes_per_sync == 0 {
            return Ok(());
        }
        if offset <= SYNC_RANGE_BUFFER {
            return Ok(());
        }

        let mut sync_to = offset - SYNC_RANGE_BUFFER;
        sync_to &= !(SYNC_RANGE_ALIGNMENT - 1);

        let last = self.sync_offset.load(Ordering::SeqCst);
        if sync_to < last + self.bytes_per_sync {
            return Ok(());
        }

        self.ratchet_sync_offset(sync_to);
        self.sync_range(sync_to)
    }

    fn ratchet_sync_offset(&self, offset: u64) {
        self.sync_offset.fetch_max(offset, Ordering::SeqCst);
    }

    fn maybe_preallocate(&self, offset: u64) -> Result<()> {
        if self.preallocate_size == 0 {
            return Ok(());
        }
        let needed = offset.div_ceil(self.preallocate_size);
        let have = self.preallocated_blocks.load(Ordering::SeqCst);
        if needed > have {
            self.preallocate(have * self.preallocate_size, (needed - have) * self.preallocate_size)?;
            self.preallocated_blocks.store(needed, Ordering::SeqCst);
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn sync_range(&self, offset: u64) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe {
            libc::sync_file_range(
                self.file.as_raw_fd(),
                0,
                offset as libc::off64_t,
                libc::SYNC_FILE_RANGE_WRITE,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn sync_range(&self, _offset: u64) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn preallocate(&self, offset: u64, len: u64) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        // Preallocation is an optimisation; filesystems without fallocate
        // support report EOPNOTSUPP and the write path carries on.
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn preallocate(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}
