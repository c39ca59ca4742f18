//! The device-facing seam: traits a backend implements to receive framed
//! messages and connection lifecycle notifications, plus the small amount
//! of transport state (vring call eventfds, negotiated features) a device
//! needs back from the connection that owns it.

use std::os::fd::RawFd;
use std::sync::Arc;

use nix::unistd::write;

use crate::codec::{self, Message};
use crate::connection::EndpointShared;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("eventfd write failed: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("send reply failed: {0}")]
    Codec(#[from] codec::Error),
}

/// Sends a handler's reply on the main channel. The connection layer calls
/// this instead of `codec::send_message` directly so a device that wants to
/// push a reply from somewhere other than its `handle_message` return value
/// (there is no such device yet, but the seam matches the original's
/// `af_unix_send_reply`) has a stable, named entry point rather than needing
/// to reach into `codec` itself.
pub fn send_reply(connfd: RawFd, msg: &Message) -> Result<(), Error> {
    codec::send_message(connfd, msg)?;
    Ok(())
}

/// One vring's transport-visible state: the eventfd the device signals to
/// tell the guest new descriptors are available, if the driver has sent one.
#[derive(Default)]
pub struct VringCallState {
    pub call_fd: Option<RawFd>,
}

/// Raises the vring's call eventfd, notifying the guest driver. A no-op
/// (not an error) when the driver hasn't set a call fd yet — that's normal
/// before negotiation completes.
pub fn vring_call(vrings: &[VringCallState], index: usize) -> Result<(), Error> {
    let Some(state) = vrings.get(index) else {
        return Ok(());
    };
    let Some(fd) = state.call_fd else {
        return Ok(());
    };
    let buf = 1u64.to_ne_bytes();
    write(fd, &buf)?;
    Ok(())
}

/// Implemented by the thing that owns device state and answers vhost-user
/// requests: SET_FEATURES, SET_VRING_NUM, GET_VRING_BASE, and so on. The
/// connection layer dispatches every message it doesn't itself own (memory
/// table, log base, protocol negotiation) here.
pub trait MessageHandler: Send {
    /// Handles one incoming request. Returns `Some(reply)` when the peer's
    /// message (or protocol feature negotiation) calls for a reply; the
    /// connection layer sends it and clears `NEED_REPLY` bookkeeping.
    fn handle_message(&mut self, msg: &Message) -> Result<Option<Message>, String>;
}

/// Connection-level lifecycle hooks a device can implement to react to the
/// transport attaching or detaching it, independent of any single message.
pub trait ConnectionEvents: Send {
    /// Called exactly once, before `connected()`, with the handle a device
    /// needs to call back into the transport on its own initiative rather
    /// than only in reply to an incoming message: `shared.main_fd` for the
    /// postcopy handshake in [`crate::memory::postcopy_handshake`], and
    /// `shared.send_slave_req`/`set_slave_req_fd` for the slave channel.
    /// Most devices that never raise an IOTLB miss or back-channel request
    /// can ignore this and keep the default no-op.
    fn attach(&mut self, _shared: Arc<EndpointShared>) {}

    /// Called once a connection's handshake (version/features exchange)
    /// completes and the device is live.
    fn connected(&mut self) {}

    /// Called when the connection is torn down, whether by peer close,
    /// protocol error, or explicit cleanup. Devices release vring state
    /// and any installed guest memory here.
    fn disconnected(&mut self) {}
}

/// A device that implements both seams; most backends are one type that
/// does both.
pub trait Device: MessageHandler + ConnectionEvents {}
impl<T: MessageHandler + ConnectionEvents> Device for T {}

/// Constructs a fresh [`Device`] for each accepted connection. A server
/// endpoint holds one factory and calls it per connection so concurrent
/// clients never share device state.
pub trait DeviceFactory: Send + Sync {
    fn new_device(&self) -> Box<dyn Device>;
}

impl<F> DeviceFactory for F
where
    F: Fn() -> Box<dyn Device> + Send + Sync,
{
    fn new_device(&self) -> Box<dyn Device> {
        (self)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::eventfd::{EventFd, EfdFlags};
    use nix::unistd::read;
    use std::os::fd::AsRawFd;

    #[test]
    fn vring_call_noop_without_call_fd() {
        let vrings = vec![VringCallState::default()];
        vring_call(&vrings, 0).unwrap();
    }

    #[test]
    fn vring_call_noop_out_of_range() {
        let vrings: Vec<VringCallState> = vec![];
        vring_call(&vrings, 3).unwrap();
    }

    #[test]
    fn vring_call_writes_eventfd() {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let vrings = vec![VringCallState {
            call_fd: Some(efd.as_raw_fd()),
        }];
        vring_call(&vrings, 0).unwrap();
        let mut buf = [0u8; 8];
        let n = read(efd.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 1);
    }
}
