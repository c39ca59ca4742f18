//! Framed message codec: one vhost-user message per `read_message`/
//! `send_message` call, including ancillary file descriptors.
//!
//! The wire format is a fixed header, a variable-length payload whose size
//! the header carries, and zero or more fds riding along as `SCM_RIGHTS`
//! ancillary data. The payload itself is opaque here — interpreting request
//! codes is the job of the out-of-scope message handler.

use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::uio::{IoSlice, IoSliceMut};

/// Matches `VHOST_MEMORY_MAX_NREGIONS`: the most fds one message ever needs
/// to carry (one per SET_MEM_TABLE region).
pub const MAX_ATTACHED_FDS: usize = 8;

/// Payload bytes beyond this are rejected as malformed rather than read.
pub const MAX_PAYLOAD: usize = 8192;

/// Flags-word bit requesting a reply on the slave channel.
pub const NEED_REPLY_BIT: u32 = 0x4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct Header {
    request: u32,
    flags: u32,
    size: u32,
}

const HEADER_LEN: usize = size_of::<Header>();

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer closed the connection")]
    Closed,
    #[error("message truncated (MSG_TRUNC or MSG_CTRUNC set)")]
    Truncated,
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("payload of {0} bytes exceeds MAX_PAYLOAD ({MAX_PAYLOAD})")]
    PayloadTooLarge(u32),
    #[error("message carried {0} fds, more than MAX_ATTACHED_FDS ({MAX_ATTACHED_FDS})")]
    TooManyFds(usize),
    #[error("syscall failed: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed vhost-user message. `fds` owns every descriptor the message
/// carries; dropping an unconsumed `Message` closes them.
#[derive(Default)]
pub struct Message {
    pub request: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn new(request: u32, payload: Vec<u8>) -> Self {
        Message {
            request,
            flags: 0,
            payload,
            fds: Vec::new(),
        }
    }

    pub fn needs_reply(&self) -> bool {
        self.flags & NEED_REPLY_BIT != 0
    }

    pub fn set_needs_reply(&mut self, need: bool) {
        if need {
            self.flags |= NEED_REPLY_BIT;
        } else {
            self.flags &= !NEED_REPLY_BIT;
        }
    }
}

/// Reads exactly one framed message from `fd`: header, then payload, then
/// any attached fds. A short payload read after a full header is a fatal
/// [`Error::Malformed`], matching the original transport's "header read ok
/// but payload truncated" treatment.
pub fn read_message(fd: RawFd) -> Result<Message, Error> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    let mut iov = [IoSliceMut::new(&mut hdr_buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; MAX_ATTACHED_FDS]);

    let recv = recvmsg::<UnixAddr>(
        fd,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    if recv.bytes == 0 {
        return Err(Error::Closed);
    }
    if recv
        .flags
        .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC)
    {
        return Err(Error::Truncated);
    }
    if recv.bytes != HEADER_LEN {
        return Err(Error::Malformed("short header read"));
    }

    let header = Header {
        request: u32::from_ne_bytes(hdr_buf[0..4].try_into().unwrap()),
        flags: u32::from_ne_bytes(hdr_buf[4..8].try_into().unwrap()),
        size: u32::from_ne_bytes(hdr_buf[8..12].try_into().unwrap()),
    };

    let mut fds: Vec<OwnedFd> = Vec::new();
    for cmsg in recv.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            if raw_fds.len() > MAX_ATTACHED_FDS {
                for f in raw_fds {
                    unsafe {
                        let _ = OwnedFd::from_raw_fd(f);
                    }
                }
                return Err(Error::TooManyFds(MAX_ATTACHED_FDS + 1));
            }
            for f in raw_fds {
                fds.push(unsafe { OwnedFd::from_raw_fd(f) });
            }
        }
    }

    if header.size as usize > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(header.size));
    }

    let mut payload = vec![0u8; header.size as usize];
    if header.size > 0 {
        read_payload_exact(fd, &mut payload)?;
    }

    Ok(Message {
        request: header.request,
        flags: header.flags,
        payload,
        fds,
    })
}

fn read_payload_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), Error> {
    let mut off = 0;
    while off < buf.len() {
        match nix::unistd::read(fd, &mut buf[off..]) {
            Ok(0) => return Err(Error::Malformed("short payload read")),
            Ok(n) => off += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Sends one framed message. The caller retains ownership of any attached
/// fds: the kernel duplicates them into the peer, the sender's copies live
/// on (and the caller closes them explicitly if they were transient).
pub fn send_message(fd: RawFd, msg: &Message) -> Result<(), Error> {
    if msg.fds.len() > MAX_ATTACHED_FDS {
        return Err(Error::TooManyFds(msg.fds.len()));
    }
    if msg.payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge(msg.payload.len() as u32));
    }

    let header = Header {
        request: msg.request,
        flags: msg.flags,
        size: msg.payload.len() as u32,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    buf.extend_from_slice(&header.request.to_ne_bytes());
    buf.extend_from_slice(&header.flags.to_ne_bytes());
    buf.extend_from_slice(&header.size.to_ne_bytes());
    buf.extend_from_slice(&msg.payload);

    let raw_fds: Vec<RawFd> = msg.fds.iter().map(|f| f.as_raw_fd()).collect();
    let cmsgs: Vec<ControlMessage> = if raw_fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(&raw_fds)]
    };

    let iov = [IoSlice::new(&buf)];
    loop {
        match sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;
    use std::os::fd::IntoRawFd;

    #[test]
    fn roundtrip_no_fds() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let a = a.into_raw_fd();
        let b = b.into_raw_fd();

        let mut msg = Message::new(7, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        msg.set_needs_reply(true);
        send_message(a, &msg).unwrap();

        let got = read_message(b).unwrap();
        assert_eq!(got.request, 7);
        assert!(got.needs_reply());
        assert_eq!(got.payload, msg.payload);
        assert!(got.fds.is_empty());

        let _ = close(a);
        let _ = close(b);
    }

    #[test]
    fn roundtrip_with_fds() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let a = a.into_raw_fd();
        let b = b.into_raw_fd();

        let t1 = tempfile::tempfile().unwrap();
        let t2 = tempfile::tempfile().unwrap();
        let stat1 = nix::sys::stat::fstat(t1.as_raw_fd()).unwrap();
        let stat2 = nix::sys::stat::fstat(t2.as_raw_fd()).unwrap();

        let mut msg = Message::new(1, vec![]);
        msg.fds.push(unsafe { OwnedFd::from_raw_fd(t1.into_raw_fd()) });
        msg.fds.push(unsafe { OwnedFd::from_raw_fd(t2.into_raw_fd()) });

        send_message(a, &msg).unwrap();
        let got = read_message(b).unwrap();
        assert_eq!(got.fds.len(), 2);
        let got_stat1 = nix::sys::stat::fstat(got.fds[0].as_raw_fd()).unwrap();
        let got_stat2 = nix::sys::stat::fstat(got.fds[1].as_raw_fd()).unwrap();
        assert_eq!(got_stat1.st_ino, stat1.st_ino);
        assert_eq!(got_stat2.st_ino, stat2.st_ino);

        let _ = close(a);
        let _ = close(b);
    }

    #[test]
    fn peer_close_is_detected() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let a = a.into_raw_fd();
        let b = b.into_raw_fd();
        let _ = close(a);
        assert!(matches!(read_message(b), Err(Error::Closed)));
        let _ = close(b);
    }
}
