//! Logging setup for guestnet.
//!
//! Everything logs through `tracing`. [`init`] installs a fmt subscriber for
//! binaries that do not bring their own:
//! - `GUESTNET_LOG=<directives>` - full `EnvFilter` syntax, e.g. `guestnet=trace`
//! - `GUESTNET_DEBUG=1` - debug output for all categories
//! - `GUESTNET_DEBUG=channel` - only the guest channels
//! - `GUESTNET_DEBUG=engine,host` - several categories

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "GUESTNET_LOG";
pub const DEBUG_ENV: &str = "GUESTNET_DEBUG";

/// Log categories that can be raised to debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Channel,
    Engine,
    Host,
}

impl LogCategory {
    const ALL: [LogCategory; 3] = [LogCategory::Channel, LogCategory::Engine, LogCategory::Host];

    fn name(self) -> &'static str {
        match self {
            LogCategory::Channel => "channel",
            LogCategory::Engine => "engine",
            LogCategory::Host => "host",
        }
    }

    /// Module targets covered by the category.
    fn targets(self) -> &'static [&'static str] {
        match self {
            LogCategory::Channel => &["guestnet::channel", "guestnet::protocol"],
            LogCategory::Engine => &["guestnet::engine", "guestnet::forwarding"],
            LogCategory::Host => &["guestnet::host"],
        }
    }
}

/// Categories named in a `GUESTNET_DEBUG` value.
fn parse_categories(value: &str) -> Vec<LogCategory> {
    let value = value.trim().to_lowercase();
    if value == "1" || value == "all" {
        return LogCategory::ALL.to_vec();
    }
    LogCategory::ALL
        .into_iter()
        .filter(|category| value.split(',').any(|part| part.trim() == category.name()))
        .collect()
}

/// Filter directives for the given environment values.
fn directives(log: Option<&str>, debug: Option<&str>) -> String {
    if let Some(log) = log.filter(|log| !log.trim().is_empty()) {
        return log.to_owned();
    }

    let mut directives = vec!["info".to_owned()];
    for category in debug.map(parse_categories).unwrap_or_default() {
        directives.extend(category.targets().iter().map(|target| format!("{target}=debug")));
    }
    directives.join(",")
}

/// Install a global fmt subscriber. Does nothing if one is already set.
pub fn init() {
    let log = std::env::var(LOG_ENV).ok();
    let debug = std::env::var(DEBUG_ENV).ok();
    let filter = EnvFilter::try_new(directives(log.as_deref(), debug.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(directives(None, None), "info");
    }

    #[test]
    fn test_log_overrides_debug() {
        assert_eq!(directives(Some("guestnet=trace"), Some("all")), "guestnet=trace");
    }

    #[test]
    fn test_debug_categories() {
        assert_eq!(
            directives(None, Some("host")),
            "info,guestnet::host=debug"
        );
        assert_eq!(parse_categories("1"), LogCategory::ALL.to_vec());
        assert_eq!(
            parse_categories("engine, channel"),
            vec![LogCategory::Channel, LogCategory::Engine]
        );
        assert!(parse_categories("vsock").is_empty());
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
