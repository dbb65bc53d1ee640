//! Host network state consumed by the engine.
//!
//! [`HostNetwork`] is the seam between the engine and the platform: it
//! reports the host's preferred address, gateway and DNS servers, the
//! address and interface tables used to resolve the guest's interface, and
//! a connectivity hint that changes whenever host reachability does.

#[cfg(target_os = "linux")]
pub mod system;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub use system::SystemHostNetwork;

/// Address with its on-link prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    pub address: IpAddr,
    pub prefix_length: u8,
}

/// 48-bit hardware address, formatted `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::host(format!("invalid MAC address {:?}", s));
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(octets))
    }
}

/// Snapshot of the host's preferred network path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    pub preferred_ip: Option<IpPrefix>,
    pub mac_address: Option<MacAddr>,
    /// Default gateways, best first.
    pub gateways: Vec<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
}

impl NetworkSettings {
    /// Best IPv4 gateway; the guest path is IPv4 only.
    pub fn best_gateway(&self) -> Option<IpAddr> {
        self.gateways.iter().copied().find(IpAddr::is_ipv4)
    }

    /// DNS servers as a comma separated list.
    pub fn dns_server_list(&self) -> String {
        join(&self.dns_servers, ",")
    }

    /// Virtio-net device options for these settings.
    ///
    /// Only non-empty fields are included, in the order client IP, MAC,
    /// gateway, name servers.
    pub fn device_options(&self) -> String {
        let mut options = Vec::with_capacity(4);
        if let Some(ip) = &self.preferred_ip {
            options.push(format!("client_ip={}", ip.address));
        }
        if let Some(mac) = &self.mac_address {
            options.push(format!("client_mac={}", mac));
        }
        if let Some(gateway) = self.best_gateway() {
            options.push(format!("gateway_ip={}", gateway));
        }
        if !self.dns_servers.is_empty() {
            options.push(format!("nameservers={}", self.dns_server_list()));
        }
        options.join(";")
    }
}

fn join(addresses: &[IpAddr], separator: &str) -> String {
    addresses.iter().map(ToString::to_string).collect::<Vec<_>>().join(separator)
}

/// One row of the host's unicast address table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnicastAddress {
    pub address: IpAddr,
    pub interface_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Per-family state of one host interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInterface {
    pub interface_id: u64,
    pub family: AddressFamily,
    pub connected: bool,
    pub mtu: u32,
}

/// Smallest MTU over connected interfaces.
pub fn minimum_connected_mtu(interfaces: &[IpInterface]) -> Option<u32> {
    interfaces
        .iter()
        .filter(|interface| interface.connected && interface.mtu > 0)
        .map(|interface| interface.mtu)
        .min()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectivityLevel {
    #[default]
    Unknown,
    None,
    LocalAccess,
    InternetAccess,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectivityCost {
    #[default]
    Unknown,
    Unrestricted,
    Fixed,
    Variable,
}

/// Opaque token for the current host reachability.
///
/// Only compared for equality: a different hint means the host network
/// changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectivityHint {
    pub level: ConnectivityLevel,
    pub cost: ConnectivityCost,
}

pub type ConnectivityCallback = Box<dyn Fn(ConnectivityHint) + Send + Sync>;

/// Registration for connectivity changes. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Source of host network state.
pub trait HostNetwork: Send + Sync {
    /// Current preferred address, MAC, gateways and DNS servers.
    fn endpoint_settings(&self) -> Result<NetworkSettings>;

    fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>>;

    fn ip_interfaces(&self) -> Result<Vec<IpInterface>>;

    fn connectivity_hint(&self) -> Result<ConnectivityHint>;

    /// Call `callback` whenever host connectivity changes.
    ///
    /// The callback runs on a thread owned by the implementation. Once the
    /// returned subscription is dropped it is not called again.
    fn subscribe(&self, callback: ConnectivityCallback) -> Result<Subscription>;
}
