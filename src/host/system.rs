//! Host network state read from the Linux kernel.
//!
//! Settings come from `/proc/net/route`, `getifaddrs(3)`, `/sys/class/net`
//! and `/etc/resolv.conf`. Connectivity changes are detected by polling.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    AddressFamily, ConnectivityCallback, ConnectivityCost, ConnectivityHint, ConnectivityLevel, HostNetwork,
    IpInterface, IpPrefix, MacAddr, NetworkSettings, Subscription, UnicastAddress,
};
use crate::config::NetworkingConfig;
use crate::error::{Error, Result};

const RTF_UP: u32 = 0x1;
const RTF_GATEWAY: u32 = 0x2;

const MONITOR_THREAD_NAME: &str = "guestnet-host-monitor";

/// [`HostNetwork`] backed by the running kernel.
#[derive(Debug, Clone)]
pub struct SystemHostNetwork {
    proc_root: PathBuf,
    sys_root: PathBuf,
    resolv_conf: PathBuf,
    poll_interval: Duration,
}

impl Default for SystemHostNetwork {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl SystemHostNetwork {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            poll_interval,
        }
    }

    pub fn from_config(config: &NetworkingConfig) -> Self {
        Self::new(config.connectivity_poll_interval)
    }

    /// Read name servers from another file, e.g. a systemd-resolved stub.
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    fn default_routes(&self) -> Result<Vec<DefaultRoute>> {
        let table = fs::read_to_string(self.proc_root.join("net/route"))?;
        Ok(parse_default_routes(&table))
    }

    fn net_class(&self, interface: &str) -> PathBuf {
        self.sys_root.join("class/net").join(interface)
    }

    fn interface_up(&self, interface: &str) -> bool {
        read_trimmed(&self.net_class(interface).join("operstate"))
            .map(|state| state == "up" || state == "unknown")
            .unwrap_or(false)
    }

    fn interface_mtu(&self, interface: &str) -> u32 {
        read_trimmed(&self.net_class(interface).join("mtu"))
            .and_then(|mtu| mtu.parse().ok())
            .unwrap_or(0)
    }

    fn interface_mac(&self, interface: &str) -> Option<MacAddr> {
        let mac: MacAddr = read_trimmed(&self.net_class(interface).join("address"))?.parse().ok()?;
        (mac.0 != [0; 6]).then_some(mac)
    }

    fn dns_servers(&self) -> Vec<IpAddr> {
        match fs::read_to_string(&self.resolv_conf) {
            Ok(contents) => parse_nameservers(&contents),
            Err(e) => {
                debug!(path = %self.resolv_conf.display(), error = %e, "no resolver configuration");
                Vec::new()
            }
        }
    }
}

impl HostNetwork for SystemHostNetwork {
    fn endpoint_settings(&self) -> Result<NetworkSettings> {
        let routes = self.default_routes()?;
        let addresses = interface_addresses()?;

        // The preferred path is the interface carrying the best default route.
        let preferred_interface = routes.first().map(|route| route.interface.clone());
        let preferred_ip = preferred_interface.as_deref().and_then(|name| {
            addresses
                .iter()
                .find(|entry| entry.name == name && entry.address.is_ipv4())
                .map(|entry| IpPrefix {
                    address: entry.address,
                    prefix_length: entry.prefix_length,
                })
        });
        let mac_address = preferred_interface.as_deref().and_then(|name| self.interface_mac(name));

        Ok(NetworkSettings {
            preferred_ip,
            mac_address,
            gateways: routes.iter().map(|route| IpAddr::V4(route.gateway)).collect(),
            dns_servers: self.dns_servers(),
        })
    }

    fn unicast_addresses(&self) -> Result<Vec<UnicastAddress>> {
        let addresses = interface_addresses()?;
        Ok(addresses
            .into_iter()
            .filter_map(|entry| {
                let interface_id = interface_index(&entry.name)?;
                Some(UnicastAddress {
                    address: entry.address,
                    interface_id,
                })
            })
            .collect())
    }

    fn ip_interfaces(&self) -> Result<Vec<IpInterface>> {
        // One row per (interface, family) that carries an address.
        let mut rows: BTreeMap<(u64, bool), IpInterface> = BTreeMap::new();
        for entry in interface_addresses()? {
            let Some(interface_id) = interface_index(&entry.name) else {
                continue;
            };
            let family = if entry.address.is_ipv4() {
                AddressFamily::Ipv4
            } else {
                AddressFamily::Ipv6
            };
            rows.entry((interface_id, entry.address.is_ipv4())).or_insert_with(|| IpInterface {
                interface_id,
                family,
                connected: !entry.address.is_loopback() && self.interface_up(&entry.name),
                mtu: self.interface_mtu(&entry.name),
            });
        }
        Ok(rows.into_values().collect())
    }

    fn connectivity_hint(&self) -> Result<ConnectivityHint> {
        let routes = self.default_routes()?;
        let level = if routes.iter().any(|route| self.interface_up(&route.interface)) {
            ConnectivityLevel::InternetAccess
        } else if self.ip_interfaces()?.iter().any(|interface| interface.connected) {
            ConnectivityLevel::LocalAccess
        } else {
            ConnectivityLevel::None
        };

        Ok(ConnectivityHint {
            level,
            cost: ConnectivityCost::Unknown,
        })
    }

    fn subscribe(&self, callback: ConnectivityCallback) -> Result<Subscription> {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let source = self.clone();
        let interval = self.poll_interval;

        let handle = thread::Builder::new().name(MONITOR_THREAD_NAME.into()).spawn(move || {
            let mut last = source.observe();
            loop {
                match cancel_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let current = source.observe();
                if current != last {
                    let hint = current.as_ref().map(|(hint, _)| *hint).unwrap_or_default();
                    info!(?hint, "host connectivity changed");
                    callback(hint);
                    last = current;
                }
            }
            debug!("host monitor stopped");
        })?;

        Ok(Subscription::new(move || {
            // Hangs up the channel; the monitor exits at its next wakeup.
            drop(cancel_tx);
            if handle.join().is_err() {
                warn!("host monitor thread panicked");
            }
        }))
    }
}

impl SystemHostNetwork {
    /// Connectivity hint plus the settings that the guest mirrors.
    fn observe(&self) -> Option<(ConnectivityHint, NetworkSettings)> {
        let hint = self.connectivity_hint();
        let settings = self.endpoint_settings();
        match (hint, settings) {
            (Ok(hint), Ok(settings)) => Some((hint, settings)),
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "failed to sample host network");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DefaultRoute {
    interface: String,
    gateway: Ipv4Addr,
    metric: u32,
}

/// Default routes with a gateway, lowest metric first.
fn parse_default_routes(table: &str) -> Vec<DefaultRoute> {
    let mut routes: Vec<DefaultRoute> = table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let destination = u32::from_str_radix(fields[1], 16).ok()?;
            let gateway = u32::from_str_radix(fields[2], 16).ok()?;
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let metric = fields[6].parse().ok()?;
            let mask = u32::from_str_radix(fields[7], 16).ok()?;

            let is_default = destination == 0 && mask == 0;
            let usable = flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0;
            (is_default && usable).then(|| DefaultRoute {
                interface: fields[0].to_owned(),
                // The kernel prints addresses in host byte order.
                gateway: Ipv4Addr::from(gateway.to_le_bytes()),
                metric,
            })
        })
        .collect();
    routes.sort_by_key(|route| route.metric);
    routes
}

fn parse_nameservers(contents: &str) -> Vec<IpAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            if words.next()? != "nameserver" {
                return None;
            }
            // Drop a zone suffix (fe80::1%eth0).
            let address = words.next()?.split('%').next()?;
            address.parse().ok()
        })
        .collect()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

#[derive(Debug, Clone)]
struct InterfaceAddress {
    name: String,
    address: IpAddr,
    prefix_length: u8,
}

fn interface_index(name: &str) -> Option<u64> {
    let name = CString::new(name).ok()?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => None,
        index => Some(u64::from(index)),
    }
}

fn interface_addresses() -> Result<Vec<InterfaceAddress>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let mut addresses = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs, freed below.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        let Some(address) = (unsafe { sockaddr_ip(entry.ifa_addr) }) else {
            continue;
        };
        let netmask = if entry.ifa_netmask.is_null() {
            None
        } else {
            unsafe { sockaddr_ip(entry.ifa_netmask) }
        };
        let host_prefix = if address.is_ipv4() { 32 } else { 128 };
        let prefix_length = netmask.map(mask_prefix_length).unwrap_or(host_prefix);

        addresses.push(InterfaceAddress {
            name: unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy().into_owned(),
            address,
            prefix_length,
        });
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(addresses)
}

/// # Safety
///
/// `addr` must point to a valid socket address.
unsafe fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    match i32::from((*addr).sa_family) {
        libc::AF_INET => {
            let sin = &*(addr as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

fn mask_prefix_length(mask: IpAddr) -> u8 {
    let ones = match mask {
        IpAddr::V4(mask) => u32::from(mask).count_ones(),
        IpAddr::V6(mask) => u128::from(mask).count_ones(),
    };
    ones as u8
}
