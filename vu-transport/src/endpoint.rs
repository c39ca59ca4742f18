//! Top-level handle a backend creates: one per vhost-user socket path,
//! server or client, owning every connection currently live on it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{self, Connection};
use crate::device::DeviceFactory;
use crate::listener::{self, ConnectOutcome};
use crate::reactor::Reactor;
use crate::reconnect::Reconnector;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("listener error: {0}")]
    Listener(#[from] listener::Error),
    #[error("connection error: {0}")]
    Connection(#[from] connection::Error),
}

/// Behavior flags a backend picks at construction time. Bundled into one
/// struct rather than a handful of `bool` parameters so call sites stay
/// readable as more flags are added — the plain-struct-of-options style
/// `perunner::cloudhypervisor::CloudHypervisorConfig` uses for its own
/// per-VM knobs.
#[derive(Clone, Copy, Debug)]
pub struct EndpointFlags {
    /// On a dropped client connection (or a transient initial connect
    /// failure), keep retrying via the [`Reconnector`] instead of failing
    /// the endpoint outright.
    pub reconnect: bool,
    /// Enable `MAP_POPULATE` and host-IOVA translation when installing
    /// guest memory regions (see [`crate::memory`]).
    pub async_copy: bool,
}

impl Default for EndpointFlags {
    fn default() -> Self {
        EndpointFlags {
            reconnect: true,
            async_copy: false,
        }
    }
}

enum Mode {
    Server,
    Client,
}

/// One vhost-user endpoint. `start()` brings up the listener (server mode)
/// or the first connection attempt (client mode); `cleanup()` tears
/// whatever's live back down. Safe to drop without calling `cleanup()`
/// first — the [`Drop`] impl runs it, so a panic unwinding through a held
/// `Endpoint` doesn't leak the listening socket or leave stale reactor
/// slots.
pub struct Endpoint {
    path: PathBuf,
    flags: EndpointFlags,
    mode: Mode,
    factory: Arc<dyn DeviceFactory>,
    connections: Mutex<Vec<Arc<Connection>>>,
    listen_fd: Mutex<Option<OwnedFd>>,
    /// Flips true inside `cleanup()`, before any connection or pending
    /// reconnect entry is torn down. A connection's spontaneous-teardown
    /// hook checks this so a race between a peer disconnecting and the
    /// endpoint shutting down never re-arms a reconnect nobody wants.
    shutting_down: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn new_server(
        path: impl Into<PathBuf>,
        factory: Arc<dyn DeviceFactory>,
        flags: EndpointFlags,
    ) -> Self {
        Endpoint {
            path: path.into(),
            flags,
            mode: Mode::Server,
            factory,
            connections: Mutex::new(Vec::new()),
            listen_fd: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new_client(
        path: impl Into<PathBuf>,
        factory: Arc<dyn DeviceFactory>,
        flags: EndpointFlags,
    ) -> Self {
        Endpoint {
            path: path.into(),
            flags,
            mode: Mode::Client,
            factory,
            connections: Mutex::new(Vec::new()),
            listen_fd: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Brings the endpoint up: binds and registers an accept callback
    /// (server) or makes one connect attempt, falling back to the
    /// reconnector on a transient failure (client). Lazily starts the
    /// process-wide reactor on first use, the way `Reactor::global()`
    /// always does.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        match self.mode {
            Mode::Server => self.start_server(),
            Mode::Client => self.start_client(),
        }
    }

    fn start_server(self: &Arc<Self>) -> Result<(), Error> {
        let listen_fd = listener::start_server(&self.path)?;
        let listen_raw = listen_fd.as_raw_fd();
        *self.listen_fd.lock().unwrap() = Some(listen_fd);

        let this = self.clone();
        Reactor::global().add(
            listen_raw,
            Box::new(move |fd, _remove| loop {
                match listener::accept_one(fd) {
                    Ok(conn_fd) => this.add_connection(conn_fd),
                    Err(listener::Error::Accept(nix::errno::Errno::EAGAIN)) => break,
                    Err(e) => {
                        log::warn!("accept() failed: {e}");
                        break;
                    }
                }
            }),
        )?;
        Ok(())
    }

    fn start_client(self: &Arc<Self>) -> Result<(), Error> {
        match listener::try_connect(&self.path) {
            Ok(conn_fd) => {
                self.add_connection(conn_fd);
                Ok(())
            }
            Err(ConnectOutcome::Retryable) => {
                if self.flags.reconnect {
                    self.arm_reconnect();
                    Ok(())
                } else {
                    Err(Error::Listener(listener::Error::NotConnected))
                }
            }
            Err(ConnectOutcome::Fatal(e)) => Err(Error::Listener(e)),
        }
    }

    /// Installs a just-accepted or just-connected fd as a live `Connection`:
    /// builds a fresh device from the endpoint's factory, registers with the
    /// reactor, and records it in this endpoint's connection list. On
    /// spontaneous teardown the connection removes itself from that list
    /// and — client mode with `reconnect` set, and the endpoint not mid
    /// `cleanup()` — re-arms the reconnector.
    fn add_connection(self: &Arc<Self>, conn_fd: OwnedFd) {
        let raw = conn_fd.as_raw_fd();
        let device = self.factory.new_device();
        let this = self.clone();
        let is_client = matches!(self.mode, Mode::Client);

        let conn = match Connection::install(conn_fd, device, move || {
            this.connections.lock().unwrap().retain(|c| c.shared.main_fd != raw);
            if is_client && this.flags.reconnect && !this.shutting_down.load(Ordering::Acquire) {
                this.arm_reconnect();
            }
        }) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("failed to install connection: {e}");
                return;
            }
        };
        self.connections.lock().unwrap().push(conn);
    }

    fn arm_reconnect(self: &Arc<Self>) {
        let this = self.clone();
        Reconnector::global().register(
            self.path.clone(),
            self.shutting_down.clone(),
            move |conn_fd| this.add_connection(conn_fd),
        );
    }

    /// Tears down every live connection and (server mode) the listening
    /// socket. Safe to call more than once. Marks the endpoint as shutting
    /// down first so no connection torn down concurrently with this call
    /// re-arms a reconnect behind our back.
    pub fn cleanup(&self) {
        self.shutting_down.store(true, Ordering::Release);

        if let Some(listen_fd) = self.listen_fd.lock().unwrap().take() {
            let raw = listen_fd.as_raw_fd();
            loop {
                match Reactor::global().try_del(raw) {
                    Ok(()) | Err(crate::reactor::Error::NotFound) => break,
                    Err(crate::reactor::Error::Busy) => {
                        std::thread::yield_now();
                        continue;
                    }
                    Err(_) => break,
                }
            }
            drop(listen_fd);
            let _ = std::fs::remove_file(&self.path);
        }

        // Pop one at a time so the list mutex is never held while
        // `shutdown` retries against the reactor's own mutex — the same
        // lock-ordering constraint §5 calls out for the reactor thread's own
        // teardown path.
        loop {
            let next = self.connections.lock().unwrap().pop();
            match next {
                Some(conn) => conn.shutdown(),
                None => break,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Message};
    use crate::device::{ConnectionEvents, Device, MessageHandler};
    use std::time::Duration;

    struct NullDevice;
    impl MessageHandler for NullDevice {
        fn handle_message(&mut self, msg: &Message) -> Result<Option<Message>, String> {
            Ok(Some(Message::new(msg.request, vec![])))
        }
    }
    impl ConnectionEvents for NullDevice {}

    struct NullFactory;
    impl DeviceFactory for NullFactory {
        fn new_device(&self) -> Box<dyn Device> {
            Box::new(NullDevice)
        }
    }

    #[test]
    fn server_lifecycle_start_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");

        let endpoint = Arc::new(Endpoint::new_server(
            path.clone(),
            Arc::new(NullFactory),
            EndpointFlags::default(),
        ));
        endpoint.start().unwrap();
        assert!(path.exists());

        let client_fd = loop {
            match listener::try_connect(&path) {
                Ok(fd) => break fd,
                Err(ConnectOutcome::Retryable) => std::thread::sleep(Duration::from_millis(20)),
                Err(ConnectOutcome::Fatal(e)) => panic!("connect failed: {e}"),
            }
        };
        let req = Message::new(1, vec![]);
        codec::send_message(client_fd.as_raw_fd(), &req).unwrap();
        let reply = codec::read_message(client_fd.as_raw_fd()).unwrap();
        assert_eq!(reply.request, 1);

        for _ in 0..50 {
            if endpoint.connection_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(endpoint.connection_count(), 1);

        endpoint.cleanup();
        assert!(!path.exists());
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[test]
    fn server_tracks_multiple_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");

        let endpoint = Arc::new(Endpoint::new_server(
            path.clone(),
            Arc::new(NullFactory),
            EndpointFlags::default(),
        ));
        endpoint.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let fd = loop {
                match listener::try_connect(&path) {
                    Ok(fd) => break fd,
                    Err(ConnectOutcome::Retryable) => {
                        std::thread::sleep(Duration::from_millis(20))
                    }
                    Err(ConnectOutcome::Fatal(e)) => panic!("connect failed: {e}"),
                }
            };
            clients.push(fd);
        }

        for _ in 0..50 {
            if endpoint.connection_count() == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(endpoint.connection_count(), 3);

        endpoint.cleanup();
        assert_eq!(endpoint.connection_count(), 0);
    }
}
