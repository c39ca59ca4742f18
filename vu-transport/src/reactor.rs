//! Single-threaded poll reactor shared by every endpoint in the process.
//!
//! One `fdset` per process, the same design the original vhost-user transport
//! uses: a slotted table of `(fd, callback)` pairs, a dispatch thread that
//! polls them all, and a wake pipe so `add()` from another thread doesn't
//! wait out a stale `poll()`.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, OnceLock};
use std::thread;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read, write};

/// Matches the original transport's `MAX_FDS` (`fd_man.h`).
pub const MAX_FDS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reactor fdset is full (max {MAX_FDS} entries)")]
    Full,
    #[error("fd is not registered in the reactor")]
    NotFound,
    #[error("fd's callback is currently running")]
    Busy,
    #[error("reactor syscall failed: {0}")]
    Errno(#[from] nix::errno::Errno),
}

/// Callback invoked when a registered fd becomes readable. `remove` starts
/// `false`; setting it to `true` tells the dispatch loop to drop the slot
/// once the callback returns.
pub type Callback = Box<dyn FnMut(RawFd, &mut bool) + Send + 'static>;

struct Slot {
    fd: RawFd,
    cb: Option<Callback>,
    /// Set for the duration of a callback invocation; `try_del` fails with
    /// `Busy` while this is set, so a concurrent cleanup never races a
    /// running callback off its own fd.
    busy: bool,
}

struct Inner {
    slots: Vec<Slot>,
}

impl Inner {
    fn position(&self, fd: RawFd) -> Option<usize> {
        self.slots.iter().position(|s| s.fd == fd)
    }
}

/// The process-wide reactor. Multiple [`crate::endpoint::Endpoint`]s register
/// their sockets here; there is exactly one dispatch thread.
pub struct Reactor {
    inner: Mutex<Inner>,
    wake_r: OwnedFd,
    wake_w: OwnedFd,
    started: OnceLock<()>,
}

static REACTOR: OnceLock<Reactor> = OnceLock::new();

impl Reactor {
    fn new() -> Self {
        let (wake_r, wake_w) = pipe().expect("reactor wake pipe");
        Reactor {
            inner: Mutex::new(Inner { slots: Vec::new() }),
            wake_r,
            wake_w,
            started: OnceLock::new(),
        }
    }

    /// Returns the process-wide reactor, starting its dispatch thread on
    /// first use.
    pub fn global() -> &'static Reactor {
        let r = REACTOR.get_or_init(Reactor::new);
        r.started.get_or_init(|| {
            thread::Builder::new()
                .name("vu-reactor".into())
                .spawn(|| Reactor::global().run())
                .expect("spawn reactor thread");
        });
        r
    }

    /// Registers `fd` with `cb`. Fails with [`Error::Full`] once `MAX_FDS`
    /// slots are occupied.
    pub fn add(&self, fd: RawFd, cb: Callback) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.slots.len() >= MAX_FDS {
            return Err(Error::Full);
        }
        inner.slots.push(Slot {
            fd,
            cb: Some(cb),
            busy: false,
        });
        drop(inner);
        self.pipe_notify();
        Ok(())
    }

    /// Removes `fd` unconditionally. Callers must guarantee the fd's
    /// callback is not currently executing on the reactor thread — the
    /// dispatch loop itself uses this after a callback sets `remove`.
    fn del(&self, fd: RawFd) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(i) = inner.position(fd) {
            inner.slots.remove(i);
        }
    }

    /// Removes `fd` unless its callback is currently running, in which case
    /// it returns [`Error::Busy`] and the caller is expected to drop any
    /// lock it holds and retry.
    pub fn try_del(&self, fd: RawFd) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.position(fd) {
            None => Err(Error::NotFound),
            Some(i) if inner.slots[i].busy => Err(Error::Busy),
            Some(i) => {
                inner.slots.remove(i);
                Ok(())
            }
        }
    }

    /// Wakes a blocked `poll()` so a just-added fd is observed promptly.
    pub fn pipe_notify(&self) {
        let _ = write(self.wake_w.as_fd(), &[0u8]);
    }

    fn run(&self) -> ! {
        let wake_fd = self.wake_r.as_raw_fd();
        loop {
            let snapshot: Vec<RawFd> = {
                let inner = self.inner.lock().unwrap();
                inner.slots.iter().map(|s| s.fd).collect()
            };

            let mut pollfds: Vec<PollFd> = Vec::with_capacity(snapshot.len() + 1);
            // SAFETY: these fds outlive the poll() call below; the wake pipe
            // lives as long as the reactor, and connection fds are only
            // closed under the reactor lock, never concurrently with this
            // snapshot-and-poll window.
            pollfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(wake_fd) },
                PollFlags::POLLIN,
            ));
            for fd in &snapshot {
                pollfds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(*fd) },
                    PollFlags::POLLIN,
                ));
            }

            match poll(&mut pollfds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => continue,
            }

            if let Some(revents) = pollfds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    let mut buf = [0u8; 64];
                    let _ = read(wake_fd, &mut buf);
                }
            }

            for (slot_fd, pfd) in snapshot.iter().zip(pollfds.iter().skip(1)) {
                let readable = pfd
                    .revents()
                    .map(|r| {
                        r.intersects(
                            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                        )
                    })
                    .unwrap_or(false);
                if !readable {
                    continue;
                }
                self.dispatch_one(*slot_fd);
            }
        }
    }

    /// Runs the single callback for `fd`, if it's still registered, then
    /// removes the slot if the callback asked to be removed.
    fn dispatch_one(&self, fd: RawFd) {
        let mut cb = {
            let mut inner = self.inner.lock().unwrap();
            let Some(i) = inner.position(fd) else {
                return;
            };
            inner.slots[i].busy = true;
            inner.slots[i].cb.take()
        };

        let mut remove = false;
        if let Some(ref mut f) = cb {
            f(fd, &mut remove);
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(i) = inner.position(fd) {
            inner.slots[i].cb = cb;
            inner.slots[i].busy = false;
        }
        drop(inner);

        if remove {
            self.del(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn add_and_fire_callback() {
        let reactor = Reactor::global();
        let (r, w) = pipe().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fd = r.as_raw_fd();
        // leak `r` into the reactor's lifetime; the callback below closes it.
        std::mem::forget(r);
        reactor
            .add(
                fd,
                Box::new(move |fd, remove| {
                    let mut buf = [0u8; 1];
                    let _ = read(fd, &mut buf);
                    hits2.fetch_add(1, Ordering::SeqCst);
                    *remove = true;
                    unsafe {
                        let _ = OwnedFd::from_raw_fd(fd);
                    }
                }),
            )
            .unwrap();
        write(w.as_fd(), &[1u8]).unwrap();
        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(reactor.try_del(fd), Err(Error::NotFound)));
    }

    #[test]
    fn try_del_busy_then_free() {
        let reactor = Reactor::global();
        let (r, w) = pipe().unwrap();
        let fd = r.as_raw_fd();
        std::mem::forget(r);
        let entered = Arc::new(AtomicUsize::new(0));
        let entered2 = entered.clone();
        reactor
            .add(
                fd,
                Box::new(move |fd, remove| {
                    entered2.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    let mut buf = [0u8; 1];
                    let _ = read(fd, &mut buf);
                    *remove = true;
                }),
            )
            .unwrap();
        write(w.as_fd(), &[1u8]).unwrap();
        while entered.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        // callback is mid-sleep: try_del must report Busy, never silently
        // remove a slot whose callback is still executing.
        assert!(matches!(reactor.try_del(fd), Err(Error::Busy)));
        thread::sleep(Duration::from_millis(200));
        assert!(matches!(reactor.try_del(fd), Err(Error::NotFound)));
        unsafe {
            let _ = OwnedFd::from_raw_fd(fd);
        }
    }
}
