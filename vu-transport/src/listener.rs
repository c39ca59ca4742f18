//! Listener: binds/listens in server mode, or attempts a single non-blocking
//! connect in client mode. Both paths hand back a plain connected fd; what
//! happens to it next is the connection layer's job. Retrying a failed
//! client connect is the [`crate::reconnect::Reconnector`]'s job, not this
//! module's — `try_connect` makes exactly one attempt and reports whether
//! that attempt is worth repeating.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept, bind, connect, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};

/// Matches the original transport's listen backlog (`fd_man.h`'s
/// `MAX_VIRTIO_BACKLOG`).
pub const MAX_VIRTIO_BACKLOG: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid socket path: {0}")]
    BadPath(String),
    #[error("socket() failed: {0}")]
    Socket(#[source] nix::errno::Errno),
    #[error("bind() failed: {0}")]
    Bind(#[source] nix::errno::Errno),
    #[error("listen() failed: {0}")]
    Listen(#[source] nix::errno::Errno),
    #[error("accept() failed: {0}")]
    Accept(#[source] nix::errno::Errno),
    #[error("connect() failed: {0}")]
    Connect(#[source] nix::errno::Errno),
    #[error("fcntl() failed while clearing O_NONBLOCK: {0}")]
    Fcntl(#[source] nix::errno::Errno),
    #[error("client connect failed and reconnect is disabled for this endpoint")]
    NotConnected,
}

/// The result of one `try_connect` attempt, distinguishing "try again
/// later" from "this will never work" the way the original transport's
/// `-1`/`-2` return codes did.
pub enum ConnectOutcome {
    /// Transient: the peer hasn't bound the path yet, or its backlog is
    /// briefly full. Worth enqueuing on the [`crate::reconnect::Reconnector`].
    Retryable,
    /// Not worth retrying (bad path, permission denied, or `O_NONBLOCK`
    /// bookkeeping itself failed).
    Fatal(Error),
}

/// Whether a failed `connect()` is worth retrying versus a fatal
/// misconfiguration. `AF_UNIX` `connect()` resolves synchronously even on a
/// non-blocking socket (no `EINPROGRESS` the way `AF_INET` gives), so a
/// single attempt is always enough to classify the outcome.
fn connect_is_retryable(e: nix::errno::Errno) -> bool {
    matches!(
        e,
        nix::errno::Errno::ENOENT
            | nix::errno::Errno::ECONNREFUSED
            | nix::errno::Errno::EAGAIN
    )
}

fn unix_addr(path: &Path) -> Result<UnixAddr, Error> {
    UnixAddr::new(path).map_err(|_| Error::BadPath(path.display().to_string()))
}

fn new_stream_socket(nonblocking: bool) -> Result<OwnedFd, Error> {
    let flags = if nonblocking {
        SockFlag::SOCK_NONBLOCK
    } else {
        SockFlag::empty()
    };
    socket(AddressFamily::Unix, SockType::Stream, flags, None).map_err(Error::Socket)
}

fn clear_nonblocking(fd: RawFd) -> Result<(), Error> {
    let raw = fcntl(fd, FcntlArg::F_GETFL).map_err(Error::Fcntl)?;
    let mut flags = OFlag::from_bits_truncate(raw);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(Error::Fcntl)?;
    Ok(())
}

/// Binds `path` and starts listening, server-style. The listening socket
/// itself is non-blocking so the reactor's accept callback never stalls the
/// dispatch thread; accepted connections default back to blocking, matching
/// normal `accept()` semantics. The socket file must not already exist —
/// callers that restart into a stale path are responsible for unlinking it
/// first; this transport never unlinks on the operator's behalf (see
/// DESIGN.md).
pub fn start_server(path: &Path) -> Result<OwnedFd, Error> {
    let addr = unix_addr(path)?;
    let fd = new_stream_socket(true)?;
    bind(fd.as_raw_fd(), &addr).map_err(Error::Bind)?;
    let backlog = Backlog::new(MAX_VIRTIO_BACKLOG as i32).expect("backlog fits i32");
    listen(&fd, backlog).map_err(Error::Listen)?;
    Ok(fd)
}

/// Accepts one connection on a listening socket produced by [`start_server`].
/// Non-blocking: callers loop this until it returns `Errno::EAGAIN` (wrapped
/// in [`Error::Accept`]) to drain every connection a single reactor wakeup
/// may have queued up.
pub fn accept_one(listen_fd: RawFd) -> Result<OwnedFd, Error> {
    let raw = accept(listen_fd).map_err(Error::Accept)?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Makes exactly one non-blocking connect attempt against `path`. On
/// success, clears `O_NONBLOCK` before handing the fd back — all subsequent
/// traffic on it is ordinary blocking I/O gated by reactor readiness.
pub fn try_connect(path: &Path) -> Result<OwnedFd, ConnectOutcome> {
    let addr = unix_addr(path).map_err(ConnectOutcome::Fatal)?;
    let fd = new_stream_socket(true).map_err(ConnectOutcome::Fatal)?;
    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {
            clear_nonblocking(fd.as_raw_fd()).map_err(ConnectOutcome::Fatal)?;
            Ok(fd)
        }
        Err(e) if connect_is_retryable(e) => Err(ConnectOutcome::Retryable),
        Err(e) => Err(ConnectOutcome::Fatal(Error::Connect(e))),
    }
}
