//! Engine configuration.

use std::time::Duration;

use crate::error::{Error, Result};

pub const LOCALHOST_RELAY_ENV: &str = "GUESTNET_LOCALHOST_RELAY";
pub const DNS_OPTIONS_ENV: &str = "GUESTNET_DNS_OPTIONS";
pub const PROPAGATE_MTU_ENV: &str = "GUESTNET_PROPAGATE_MTU";
pub const TRACK_GUEST_INTERFACE_ENV: &str = "GUESTNET_TRACK_GUEST_INTERFACE";
pub const RESOLVE_TIMEOUT_ENV: &str = "GUESTNET_RESOLVE_TIMEOUT_MS";
pub const TRANSACTION_TIMEOUT_ENV: &str = "GUESTNET_TRANSACTION_TIMEOUT_MS";
pub const REFRESH_SETTINGS_ENV: &str = "GUESTNET_REFRESH_SETTINGS";

/// Header the guest writes at the top of its generated resolv.conf.
pub const RESOLV_CONF_HEADER: &str = "\
# This file was automatically generated by guestnet from the host's network settings.
# Local changes are overwritten whenever the host network changes.
";

/// Options for a [`NetworkEngine`](crate::NetworkEngine).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use guestnet::NetworkingConfig;
///
/// let config = NetworkingConfig::default()
///     .with_localhost_relay(true)
///     .with_resolve_timeout(Duration::from_secs(5));
/// assert!(config.enable_localhost_relay);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkingConfig {
    /// Expose guest binds on host loopback through the `loopback0` device.
    pub enable_localhost_relay: bool,
    /// Text sent as the DNS `Options` field; the guest places it at the top
    /// of its resolv.conf.
    pub dns_options: String,
    /// Send MTU changes to the guest after boot. Off by default: changes are
    /// only tracked and logged.
    pub propagate_mtu: bool,
    /// Re-resolve the guest's host interface after connectivity changes.
    pub track_guest_interface: bool,
    /// Re-send address, default route and DNS to the guest when the host's
    /// settings change after boot.
    pub refresh_settings: bool,
    /// Deadline for resolving the guest address to a host interface.
    pub resolve_timeout: Duration,
    pub resolve_poll_interval: Duration,
    /// Poll interval of the Linux host monitor.
    pub connectivity_poll_interval: Duration,
    /// Bound on one configuration round trip. `None` waits forever.
    pub transaction_timeout: Option<Duration>,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            enable_localhost_relay: false,
            dns_options: RESOLV_CONF_HEADER.to_owned(),
            propagate_mtu: false,
            track_guest_interface: true,
            refresh_settings: false,
            resolve_timeout: Duration::from_secs(10),
            resolve_poll_interval: Duration::from_millis(100),
            connectivity_poll_interval: Duration::from_secs(2),
            transaction_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl NetworkingConfig {
    /// Defaults overridden by `GUESTNET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(LOCALHOST_RELAY_ENV) {
            config.enable_localhost_relay = parse_bool(LOCALHOST_RELAY_ENV, &raw)?;
        }
        if let Some(raw) = lookup(DNS_OPTIONS_ENV) {
            config.dns_options = raw;
        }
        if let Some(raw) = lookup(PROPAGATE_MTU_ENV) {
            config.propagate_mtu = parse_bool(PROPAGATE_MTU_ENV, &raw)?;
        }
        if let Some(raw) = lookup(TRACK_GUEST_INTERFACE_ENV) {
            config.track_guest_interface = parse_bool(TRACK_GUEST_INTERFACE_ENV, &raw)?;
        }
        if let Some(raw) = lookup(REFRESH_SETTINGS_ENV) {
            config.refresh_settings = parse_bool(REFRESH_SETTINGS_ENV, &raw)?;
        }
        if let Some(raw) = lookup(RESOLVE_TIMEOUT_ENV) {
            config.resolve_timeout = parse_millis(RESOLVE_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(TRANSACTION_TIMEOUT_ENV) {
            // 0 disables the bound.
            let timeout = parse_millis(TRANSACTION_TIMEOUT_ENV, &raw)?;
            config.transaction_timeout = (!timeout.is_zero()).then_some(timeout);
        }

        Ok(config)
    }

    pub fn with_localhost_relay(mut self, enabled: bool) -> Self {
        self.enable_localhost_relay = enabled;
        self
    }

    pub fn with_dns_options(mut self, options: impl Into<String>) -> Self {
        self.dns_options = options.into();
        self
    }

    pub fn with_mtu_propagation(mut self, enabled: bool) -> Self {
        self.propagate_mtu = enabled;
        self
    }

    pub fn with_guest_interface_tracking(mut self, enabled: bool) -> Self {
        self.track_guest_interface = enabled;
        self
    }

    pub fn with_settings_refresh(mut self, enabled: bool) -> Self {
        self.refresh_settings = enabled;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_resolve_poll_interval(mut self, interval: Duration) -> Self {
        self.resolve_poll_interval = interval;
        self
    }

    pub fn with_connectivity_poll_interval(mut self, interval: Duration) -> Self {
        self.connectivity_poll_interval = interval;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    let value = raw.trim();
    if value == "1" || ["true", "yes", "on"].iter().any(|v| value.eq_ignore_ascii_case(v)) {
        Ok(true)
    } else if value == "0" || ["false", "no", "off"].iter().any(|v| value.eq_ignore_ascii_case(v)) {
        Ok(false)
    } else {
        Err(Error::InvalidConfig(format!("{name}={raw:?} is not a boolean")))
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidConfig(format!("{name}={raw:?} is not a number of milliseconds")))
}
