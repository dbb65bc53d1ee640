//! Host/guest channels.
//!
//! Two independent channels connect the host to the guest network agent:
//! the configuration channel, where the host sends requests and the guest
//! answers, and the port tracker channel, where the guest sends requests
//! and the host answers.

pub mod config;
pub mod port_tracker;
pub mod transport;
#[cfg(target_os = "linux")]
pub mod vsock;

pub use config::ConfigChannel;
pub use port_tracker::PortEventServer;
pub use transport::{DuplexStream, StreamTransport, Transport, TransportCloser};
