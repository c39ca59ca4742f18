//! Minimal vhost-user control-plane endpoint: binds a socket, accepts one
//! or more peers, and answers requests with a device that tracks nothing
//! but a request counter. Exists to exercise `vu-transport` end to end, the
//! way a toy block backend exercises a real virtio queue implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use vu_transport::{ConnectionEvents, Device, DeviceFactory, Endpoint, EndpointFlags, MessageHandler};

/// A device that answers every request with an empty reply and counts how
/// many messages it has seen, for a sanity log line on disconnect.
struct CounterDevice {
    requests_seen: AtomicU64,
}

impl MessageHandler for CounterDevice {
    fn handle_message(
        &mut self,
        msg: &vu_transport::codec::Message,
    ) -> Result<Option<vu_transport::codec::Message>, String> {
        self.requests_seen.fetch_add(1, Ordering::Relaxed);
        let mut reply = vu_transport::codec::Message::new(msg.request, vec![]);
        reply.flags = msg.flags & !vu_transport::codec::NEED_REPLY_BIT;
        Ok(Some(reply))
    }
}

impl ConnectionEvents for CounterDevice {
    fn connected(&mut self) {
        info!("peer connected");
    }

    fn disconnected(&mut self) {
        info!(
            "peer disconnected after {} requests",
            self.requests_seen.load(Ordering::Relaxed)
        );
    }
}

struct CounterFactory;

impl DeviceFactory for CounterFactory {
    fn new_device(&self) -> Box<dyn Device> {
        Box::new(CounterDevice {
            requests_seen: AtomicU64::new(0),
        })
    }
}

fn main() {
    env_logger::init();
    let args: Vec<_> = std::env::args().collect();
    let socket = args.get(1).expect("give me a socket path");

    let endpoint = Arc::new(Endpoint::new_server(
        socket.as_str(),
        Arc::new(CounterFactory),
        EndpointFlags::default(),
    ));

    info!("listening on {socket}");
    if let Err(e) = endpoint.start() {
        warn!("failed to start endpoint: {e}");
        std::process::exit(1);
    }

    // The accept loop and per-connection reactor callbacks run on their own
    // threads; park the main thread until the process is killed.
    loop {
        std::thread::park();
    }
}
