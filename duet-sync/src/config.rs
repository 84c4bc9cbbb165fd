//! Client and relay configuration.
//!
//! Both structs have usable defaults and can be overlaid from `DUET_*`
//! environment variables. Unparseable values are logged and ignored.

use std::time::Duration;

use uuid::Uuid;

use crate::buffer::DEFAULT_BATCH_INTERVAL;
use crate::value::ValueCoercion;

pub const ENV_USER_ID: &str = "DUET_USER_ID";
pub const ENV_SERVER_URL: &str = "DUET_SERVER_URL";
pub const ENV_BATCH_INTERVAL_MS: &str = "DUET_BATCH_INTERVAL_MS";
pub const ENV_RELAY_ADDR: &str = "DUET_RELAY_ADDR";
pub const ENV_RELAY_PORT: &str = "DUET_RELAY_PORT";

/// Default relay port.
pub const DEFAULT_PORT: u16 = 8080;

/// Per-editor configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity stamped on outgoing envelopes; must differ between peers
    pub user_id: String,
    /// Relay WebSocket URL
    pub server_url: String,
    /// How long local edits accumulate before being flushed
    pub batch_interval: Duration,
    /// How untagged numeric arrays are interpreted on replay
    pub coercion: ValueCoercion,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
            server_url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            batch_interval: DEFAULT_BATCH_INTERVAL,
            coercion: ValueCoercion::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(user_id) = lookup(ENV_USER_ID).filter(|s| !s.is_empty()) {
            config.user_id = user_id;
        }
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|s| !s.is_empty()) {
            config.server_url = url;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BATCH_INTERVAL_MS) {
            config.batch_interval = Duration::from_millis(ms);
        }
        config
    }
}

/// Relay process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DUET_RELAY_ADDR` wins over `DUET_RELAY_PORT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(addr) = lookup(ENV_RELAY_ADDR).filter(|s| !s.is_empty()) {
            return Self { bind_addr: addr };
        }
        match parse_var::<u16>(&lookup, ENV_RELAY_PORT) {
            Some(port) => Self {
                bind_addr: format!("0.0.0.0:{port}"),
            },
            None => Self::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}
