//! One vhost-user connection: the main channel plus its optional slave
//! (back-)channel, wired into the reactor and dispatching framed messages
//! to a device.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::codec::{self, Message};
use crate::device::Device;
use crate::logbase::LogBaseSlot;
use crate::reactor::Reactor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] codec::Error),
    #[error("reactor error: {0}")]
    Reactor(#[from] crate::reactor::Error),
    #[error("slave request fd is already set for this connection")]
    SlaveReqFdAlreadySet,
    #[error("no slave request fd installed on this connection")]
    NoSlaveReqFd,
    #[error("slave reply carried request {got}, expected {sent}")]
    SlaveReplyMismatch { sent: u32, got: u32 },
}

/// State shared between a connection's main-channel callback (running on
/// the reactor thread) and any slave-channel calls a device makes from its
/// own context (e.g. an IOTLB miss notification). Also the device's handle
/// for the log-base installer — `log` is the "current log mapping" §4.H/§4.E
/// talk about. A device's `handle_message` reaches it through the
/// `Arc<EndpointShared>` [`crate::device::ConnectionEvents::attach`] hands it:
/// on a `SET_LOG_BASE` request it extracts the fd/offset/size from the
/// message payload and calls `shared.log.set_log_base(fd, offset, size)`.
pub struct EndpointShared {
    pub main_fd: RawFd,
    slave_req_fd: Mutex<Option<OwnedFd>>,
    pub log: LogBaseSlot,
}

impl EndpointShared {
    /// Installs the slave-channel fd the peer sent with
    /// `SET_SLAVE_REQ_FD`. Rejects a second installation attempt rather than
    /// silently replacing (and leaking) the first — a connection is set up
    /// once, not renegotiated mid-session (§9 open question, decided in
    /// DESIGN.md).
    pub fn set_slave_req_fd(&self, fd: OwnedFd) -> Result<(), Error> {
        let mut slot = self.slave_req_fd.lock().unwrap();
        if slot.is_some() {
            return Err(Error::SlaveReqFdAlreadySet);
        }
        *slot = Some(fd);
        Ok(())
    }

    pub fn has_slave_req_fd(&self) -> bool {
        self.slave_req_fd.lock().unwrap().is_some()
    }

    /// Sends a request on the slave channel and, if it carries
    /// `NEED_REPLY`, blocks for the matching reply and interprets it.
    /// Holding `slave_req_fd`'s mutex across the whole round-trip is the
    /// idiomatic stand-in for the original's `slave_req_lock` spinlock:
    /// at most one `NEED_REPLY` request is ever in flight on this
    /// connection, and the lock is released on every exit path (including
    /// a mismatched reply), matching §4.E.
    pub fn send_slave_req(&self, msg: &Message) -> Result<bool, Error> {
        let slot = self.slave_req_fd.lock().unwrap();
        let fd = slot.as_ref().ok_or(Error::NoSlaveReqFd)?.as_raw_fd();
        codec::send_message(fd, msg)?;
        if !msg.needs_reply() {
            return Ok(true);
        }
        let reply = codec::read_message(fd)?;
        process_slave_message_reply(msg, &reply)
    }

    /// §4.E's `cleanup_device(dev)`: unmaps the log region if mapped, and
    /// closes `slave_req_fd` if set. Distinct from [`Connection::shutdown`],
    /// which tears down the connection's fd and reactor registration — this
    /// one only releases the two device-owned resources this struct holds.
    /// Idempotent: both `LogBaseSlot::clear` and taking `slave_req_fd` are
    /// no-ops on an already-empty slot.
    pub fn cleanup_device(&self) {
        self.log.clear();
        self.slave_req_fd.lock().unwrap().take();
    }
}

/// Matches a reply read from the slave channel against the request that
/// solicited it. `Ok(true)` iff no reply was requested, or one was and its
/// payload's leading `u64` is zero (the slave channel's success sentinel).
pub fn process_slave_message_reply(sent: &Message, reply: &Message) -> Result<bool, Error> {
    if !sent.needs_reply() {
        return Ok(true);
    }
    if reply.request != sent.request {
        return Err(Error::SlaveReplyMismatch {
            sent: sent.request,
            got: reply.request,
        });
    }
    let success = reply
        .payload
        .get(0..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
        .map(|v| v == 0)
        .unwrap_or(false);
    Ok(success)
}

/// A live connection. The fd and the device's `disconnected()` notification
/// are torn down exactly once, whichever of [`Connection::shutdown`]
/// or a spontaneous read-callback failure gets there first — see
/// `teardown_once` below, which both paths fold into.
pub struct Connection {
    pub shared: Arc<EndpointShared>,
    device: Arc<Mutex<Box<dyn Device>>>,
    fd_slot: Arc<Mutex<Option<OwnedFd>>>,
    /// Runs once, only on a *spontaneous* teardown (peer close, malformed
    /// message, handler rejection) — never on an explicit
    /// `Endpoint::cleanup()`. This is where the owning `Endpoint` removes
    /// the connection from its list and, for a client with `reconnect` set,
    /// re-arms the reconnector.
    teardown_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    /// Wires `conn_fd` into the process reactor: every time it becomes
    /// readable, one framed message is read and dispatched to `device`.
    /// `on_teardown` is the owning endpoint's hook for self-removal and
    /// reconnect re-arming; it never runs for an explicit
    /// [`Connection::shutdown`] call.
    pub fn install(
        conn_fd: OwnedFd,
        mut device: Box<dyn Device>,
        on_teardown: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Connection>, Error> {
        let raw = conn_fd.as_raw_fd();
        let fd_slot = Arc::new(Mutex::new(Some(conn_fd)));
        let shared = Arc::new(EndpointShared {
            main_fd: raw,
            slave_req_fd: Mutex::new(None),
            log: LogBaseSlot::empty(),
        });

        device.attach(shared.clone());
        device.connected();
        let device = Arc::new(Mutex::new(device));

        let connection = Arc::new(Connection {
            shared: shared.clone(),
            device: device.clone(),
            fd_slot,
            teardown_hook: Mutex::new(Some(Box::new(on_teardown))),
        });

        let connection_for_cb = connection.clone();
        Reactor::global().add(
            raw,
            Box::new(move |fd, remove| {
                match codec::read_message(fd) {
                    Ok(msg) => {
                        let reply = {
                            let mut dev = connection_for_cb.device.lock().unwrap();
                            dev.handle_message(&msg)
                        };
                        match reply {
                            Ok(Some(reply)) => {
                                let _ = crate::device::send_reply(fd, &reply);
                            }
                            Ok(None) => {}
                            Err(_) => *remove = true,
                        }
                    }
                    Err(_) => *remove = true,
                }
                if *remove {
                    connection_for_cb.teardown_once();
                }
            }),
        )?;

        Ok(connection)
    }

    /// Closes the fd, notifies the device, and (only the first caller to
    /// reach this for a given connection) runs the spontaneous-teardown
    /// hook. Idempotent: the reactor's own teardown path and an explicit
    /// `shutdown()` can race (the "cleanup races read-cb" scenario), and
    /// exactly one of them performs the actual work — the `fd_slot` mutex's
    /// `take()` is the single point of arbitration.
    fn teardown_once(&self) {
        let fd = self.fd_slot.lock().unwrap().take();
        if let Some(fd) = fd {
            drop(fd);
            self.shared.cleanup_device();
            self.device.lock().unwrap().disconnected();
            if let Some(hook) = self.teardown_hook.lock().unwrap().take() {
                hook();
            }
        }
    }

    /// Tears down the connection from outside the reactor thread: removes
    /// it from the reactor (retrying while the callback is mid-flight, the
    /// same try-then-retry protocol [`crate::endpoint::Endpoint::cleanup`]
    /// uses), then runs the idempotent teardown. Does *not* invoke the
    /// reconnect hook — callers use this for an orderly shutdown, not a
    /// dropped connection. Named distinctly from [`EndpointShared::cleanup_device`]
    /// (the §4.E device-resource release this calls as part of its work) to
    /// keep the two operations from being mistaken for one another.
    pub fn shutdown(&self) {
        loop {
            match Reactor::global().try_del(self.shared.main_fd) {
                Ok(()) | Err(crate::reactor::Error::NotFound) => break,
                Err(crate::reactor::Error::Busy) => {
                    std::thread::yield_now();
                    continue;
                }
                Err(_) => break,
            }
        }
        self.teardown_once();
    }
}
