//! # guestnet
//!
//! Host-side networking for a virtualized guest: configures the guest's
//! virtio-net adapter from the host's preferred network path, keeps it in
//! sync as the host network changes, and relays the guest's port binds back
//! to the host.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::os::unix::net::UnixStream;
//! use guestnet::{ConfigChannel, NetworkEngine, NetworkingConfig, Result, StreamTransport, SystemHostNetwork};
//!
//! # fn attach_nic(_tag: &str, _options: &str) -> Result<uuid::Uuid> { unimplemented!() }
//! fn main() -> Result<()> {
//!     guestnet::logging::init();
//!     let config = NetworkingConfig::from_env()?;
//!
//!     let channel = ConfigChannel::over_stream(UnixStream::connect("/run/guest/gns.sock")?, &config)?;
//!     let engine = NetworkEngine::builder(channel, Arc::new(SystemHostNetwork::from_config(&config)), config)
//!         .on_add_guest_device(|_class, _device, tag, options| attach_nic(tag, options))
//!         .on_modify_open_ports(|_class, _tag, _addr, _protocol, _open| 0)
//!         .on_guest_interface_state_changed(|_name, _up| {})
//!         .build();
//!
//!     engine.initialize()?;
//!     let ports = StreamTransport::new(UnixStream::connect("/run/guest/ports.sock")?, "ports");
//!     engine.start_port_tracker(ports)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Channels
//!
//! - **Configuration**: host requests, guest answers with a result code.
//! - **Port tracker**: guest requests, host answers with a result code.

pub mod channel;
pub mod config;
pub mod engine;
mod error;
pub mod forwarding;
pub mod host;
pub mod logging;
pub mod protocol;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports
pub use channel::{ConfigChannel, PortEventServer, StreamTransport, Transport};
pub use config::NetworkingConfig;
pub use engine::{EngineState, InitialNetworkingConfiguration, NetworkEngine, NetworkEngineBuilder};
pub use error::{Error, Result};
pub use forwarding::Protocol;
pub use host::{ConnectivityHint, HostNetwork, NetworkSettings};
#[cfg(target_os = "linux")]
pub use host::SystemHostNetwork;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
