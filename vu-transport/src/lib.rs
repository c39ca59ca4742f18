//! Transport and connection-management core for a vhost-user control-plane
//! endpoint: a framed fd-passing codec over `AF_UNIX`, a shared poll
//! reactor, server/client listeners with client-side reconnect, guest
//! memory and dirty-log installers, and the device-facing traits a backend
//! implements against.

pub mod codec;
pub mod connection;
pub mod device;
pub mod endpoint;
pub mod listener;
pub mod logbase;
pub mod memory;
pub mod reactor;
pub mod reconnect;

pub use connection::{process_slave_message_reply, Connection, EndpointShared};
pub use device::{ConnectionEvents, Device, DeviceFactory, MessageHandler};
pub use endpoint::{Endpoint, EndpointFlags};
