//! Dirty-page log: the SET_LOG_BASE handler's transport half. Maps the
//! shared log region the peer hands over and exposes the bit-set operation
//! the device layer calls on every guest write it forwards.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;

use libc::c_void;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("log mmap failed: {0}")]
    Mmap(#[source] std::io::Error),
    #[error("log size must be nonzero")]
    ZeroSize,
}

/// A mapped dirty-page log, one bit per guest page. The backing fd is closed
/// right after `mmap` succeeds — the mapping stays valid without it, and §4.H
/// requires the fd not outlive the call that installed it, matching the
/// original's `close(fd)` immediately after `mmap()`.
pub struct LogBase {
    addr: usize,
    size: usize,
}

// SAFETY: `addr` points at a `MAP_SHARED` region for the lifetime of the
// struct; concurrent bit sets from multiple threads use `fetch_or`, which is
// safe on shared memory the kernel also reads (log consumers expect torn
// reads of individual bits to still resolve to `0` or `1`).
unsafe impl Send for LogBase {}
unsafe impl Sync for LogBase {}

impl LogBase {
    /// Maps `size` bytes of `fd` starting at `mmap_offset`, which is to be
    /// used as the dirty-page bitmap. `fd` is closed before this returns,
    /// success or failure alike — the original closes it unconditionally
    /// right after the `mmap()` call, before even checking `MAP_FAILED`.
    pub fn new(fd: OwnedFd, mmap_offset: u64, size: u64) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut::<c_void>(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                mmap_offset as libc::off_t,
            )
        };
        drop(fd);
        if addr == libc::MAP_FAILED {
            return Err(Error::Mmap(std::io::Error::last_os_error()));
        }
        Ok(LogBase {
            addr: addr as usize,
            size: size as usize,
        })
    }

    /// Sets the dirty bit for the page at `page_index`. Silently ignores
    /// indices past the mapped region rather than panicking: a device racing
    /// a SET_LOG_BASE teardown against an in-flight write is expected, not
    /// exceptional.
    pub fn mark_dirty(&self, page_index: u64) {
        let byte = (page_index / 8) as usize;
        let bit = (page_index % 8) as u8;
        if byte >= self.size {
            return;
        }
        unsafe {
            let ptr = (self.addr as *mut u8).add(byte);
            let atomic = &*(ptr as *const std::sync::atomic::AtomicU8);
            atomic.fetch_or(1 << bit, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn is_dirty(&self, page_index: u64) -> bool {
        let byte = (page_index / 8) as usize;
        let bit = (page_index % 8) as u8;
        if byte >= self.size {
            return false;
        }
        unsafe {
            let ptr = (self.addr as *const u8).add(byte);
            (*ptr & (1 << bit)) != 0
        }
    }
}

impl Drop for LogBase {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut c_void, self.size);
        }
    }
}

/// The "current log mapping" slot a connection's device holds: at most one
/// `LogBase` live at a time. Installing a new one over an old one unmaps the
/// old one first, matching §4.H's "if a previous log mapping exists, unmap
/// it" — the replacement happens by simply dropping the previous `Option`
/// value, which runs `LogBase`'s `Drop` impl.
#[derive(Default)]
pub struct LogBaseSlot(Mutex<Option<LogBase>>);

impl LogBaseSlot {
    pub fn empty() -> Self {
        LogBaseSlot(Mutex::new(None))
    }

    /// The SET_LOG_BASE entry point: maps `fd` as the new log and replaces
    /// whatever was mapped before, unmapping it in the process.
    pub fn set_log_base(&self, fd: OwnedFd, mmap_offset: u64, size: u64) -> Result<(), Error> {
        let log = LogBase::new(fd, mmap_offset, size)?;
        *self.0.lock().unwrap() = Some(log);
        Ok(())
    }

    /// Unmaps the current log, if any. Used directly by `cleanup_device` and
    /// indirectly by `set_log_base` installing a replacement.
    pub fn clear(&self) {
        self.0.lock().unwrap().take();
    }

    pub fn is_mapped(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn mark_dirty(&self, page_index: u64) {
        if let Some(log) = self.0.lock().unwrap().as_ref() {
            log.mark_dirty(page_index);
        }
    }

    pub fn is_dirty(&self, page_index: u64) -> bool {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .map(|log| log.is_dirty(page_index))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn anon_fd(size: u64) -> OwnedFd {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        let raw = std::os::fd::IntoRawFd::into_raw_fd(file);
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn mark_and_query_dirty_bit() {
        let log = LogBase::new(anon_fd(64), 0, 64).unwrap();
        assert!(!log.is_dirty(10));
        log.mark_dirty(10);
        assert!(log.is_dirty(10));
        assert!(!log.is_dirty(9));
        assert!(!log.is_dirty(11));
    }

    #[test]
    fn out_of_range_index_is_noop() {
        let log = LogBase::new(anon_fd(8), 0, 8).unwrap();
        log.mark_dirty(1_000_000);
        assert!(!log.is_dirty(1_000_000));
    }

    #[test]
    fn zero_size_rejected() {
        assert!(matches!(LogBase::new(anon_fd(8), 0, 0), Err(Error::ZeroSize)));
    }

    #[test]
    fn slot_set_log_base_replaces_and_unmaps_previous() {
        let slot = LogBaseSlot::empty();
        slot.set_log_base(anon_fd(64), 0, 64).unwrap();
        slot.mark_dirty(5);
        assert!(slot.is_dirty(5));

        // Installing a second log base replaces the first; the first's
        // mapping is unmapped as a side effect of being dropped, and the new
        // one starts out clean.
        slot.set_log_base(anon_fd(64), 0, 64).unwrap();
        assert!(!slot.is_dirty(5));
    }

    #[test]
    fn slot_clear_unmaps() {
        let slot = LogBaseSlot::empty();
        assert!(!slot.is_mapped());
        slot.set_log_base(anon_fd(8), 0, 8).unwrap();
        assert!(slot.is_mapped());
        slot.clear();
        assert!(!slot.is_mapped());
    }
}
