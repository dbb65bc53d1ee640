//! Mapping of guest port binds to host port reservations.
//!
//! A guest bind can be exposed on two host paths: straight through the
//! primary adapter, and through the loopback relay device so host-local
//! clients reach it on `localhost`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::warn;

/// Tag of the primary guest network device.
pub const PRIMARY_DEVICE_TAG: &str = "eth0";

/// Tag of the loopback relay device.
pub const LOOPBACK_DEVICE_TAG: &str = "loopback0";

const IPPROTO_TCP: i32 = 6;
const IPPROTO_UDP: i32 = 17;

/// Transport protocol of a guest bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(i32),
}

impl From<i32> for Protocol {
    fn from(value: i32) -> Self {
        match value {
            IPPROTO_TCP => Protocol::Tcp,
            IPPROTO_UDP => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

impl From<Protocol> for i32 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => IPPROTO_TCP,
            Protocol::Udp => IPPROTO_UDP,
            Protocol::Other(value) => value,
        }
    }
}

/// Host device a reservation is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingTarget {
    /// Loopback relay (`loopback0`).
    Loopback,
    /// Primary adapter (`eth0`).
    Primary,
}

impl ForwardingTarget {
    pub fn tag(self) -> &'static str {
        match self {
            ForwardingTarget::Loopback => LOOPBACK_DEVICE_TAG,
            ForwardingTarget::Primary => PRIMARY_DEVICE_TAG,
        }
    }
}

/// One host port reservation to open or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingAction {
    pub target: ForwardingTarget,
    pub address: SocketAddr,
    pub protocol: Protocol,
    pub allocate: bool,
}

/// Decide which host reservations a guest bind needs.
///
/// Of the IPv4 loopback range only `127.0.0.1` is relayed; other loopback
/// addresses, `::1` included, stay on the guest's own `lo` and produce no
/// action. Relay actions come before direct ones.
pub fn plan(address: SocketAddr, protocol: Protocol, allocate: bool, relay_enabled: bool) -> Vec<ForwardingAction> {
    let ip = address.ip();
    if ip.is_loopback() && ip != IpAddr::V4(Ipv4Addr::LOCALHOST) {
        return Vec::new();
    }

    let mut actions = Vec::with_capacity(2);

    if relay_enabled && (ip.is_unspecified() || ip.is_loopback()) {
        let loopback = match ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        actions.push(ForwardingAction {
            target: ForwardingTarget::Loopback,
            address: SocketAddr::new(loopback, address.port()),
            protocol,
            allocate,
        });
    }

    if !ip.is_loopback() {
        actions.push(ForwardingAction {
            target: ForwardingTarget::Primary,
            address,
            protocol,
            allocate,
        });
    }

    actions
}

/// Run every action and fold the results.
///
/// All actions are attempted. Returns 0 if all succeeded, otherwise the
/// first nonzero result.
pub fn apply<F>(actions: &[ForwardingAction], mut modify: F) -> i32
where
    F: FnMut(&ForwardingAction) -> i32,
{
    let mut result = 0;
    for action in actions {
        let status = modify(action);
        if status != 0 {
            warn!(
                target_device = action.target.tag(),
                address = %action.address,
                allocate = action.allocate,
                status,
                "failed to modify host port"
            );
            if result == 0 {
                result = status;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(address: &str, relay: bool) -> Vec<ForwardingTarget> {
        plan(address.parse().unwrap(), Protocol::Tcp, true, relay)
            .into_iter()
            .map(|action| action.target)
            .collect()
    }

    #[test]
    fn test_unspecified_with_relay() {
        let actions = plan("0.0.0.0:8080".parse().unwrap(), Protocol::Tcp, true, true);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].target, ForwardingTarget::Loopback);
        assert_eq!(actions[0].address, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(actions[1].target, ForwardingTarget::Primary);
        assert_eq!(actions[1].address, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_unspecified_without_relay() {
        assert_eq!(targets("0.0.0.0:80", false), vec![ForwardingTarget::Primary]);
    }

    #[test]
    fn test_specific_address() {
        assert_eq!(targets("10.0.0.5:80", true), vec![ForwardingTarget::Primary]);
    }

    #[test]
    fn test_localhost_relay_only() {
        let actions = plan("127.0.0.1:3000".parse().unwrap(), Protocol::Udp, false, true);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target, ForwardingTarget::Loopback);
        assert_eq!(actions[0].address, "127.0.0.1:3000".parse().unwrap());
        assert!(!actions[0].allocate);
        assert_eq!(actions[0].protocol, Protocol::Udp);
    }

    #[test]
    fn test_localhost_without_relay() {
        assert!(targets("127.0.0.1:3000", false).is_empty());
    }

    #[test]
    fn test_other_loopback_addresses_ignored() {
        assert!(targets("127.0.0.2:3000", true).is_empty());
        assert!(targets("[::1]:3000", true).is_empty());
    }

    #[test]
    fn test_ipv6_unspecified_relays_to_ipv6_loopback() {
        let actions = plan("[::]:443".parse().unwrap(), Protocol::Tcp, true, true);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].address, "[::1]:443".parse().unwrap());
        assert_eq!(actions[1].address, "[::]:443".parse().unwrap());
    }

    #[test]
    fn test_apply_reports_first_failure() {
        let actions = plan("0.0.0.0:8080".parse().unwrap(), Protocol::Tcp, true, true);
        let mut calls = Vec::new();
        let result = apply(&actions, |action| {
            calls.push(action.target);
            match action.target {
                ForwardingTarget::Loopback => 5,
                ForwardingTarget::Primary => 7,
            }
        });
        assert_eq!(result, 5);
        assert_eq!(calls, vec![ForwardingTarget::Loopback, ForwardingTarget::Primary]);
    }

    #[test]
    fn test_apply_later_failure_surfaces() {
        let actions = plan("0.0.0.0:8080".parse().unwrap(), Protocol::Tcp, true, true);
        let result = apply(&actions, |action| match action.target {
            ForwardingTarget::Loopback => 0,
            ForwardingTarget::Primary => 9,
        });
        assert_eq!(result, 9);
        assert_eq!(apply(&[], |_| 1), 0);
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::from(6), Protocol::Tcp);
        assert_eq!(Protocol::from(17), Protocol::Udp);
        assert_eq!(Protocol::from(1), Protocol::Other(1));
        assert_eq!(i32::from(Protocol::Udp), 17);
    }
}
