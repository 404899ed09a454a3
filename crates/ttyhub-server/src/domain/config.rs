//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings.
//! Every field has a default, so a config file only needs to name what it
//! changes.  The binary layers CLI flags and environment variables on top
//! (see `main.rs`); this module never reads files or the environment itself.
//!
//! ```toml
//! device_bind_addr = "0.0.0.0:5912"
//! device_token = "change-me"
//! max_sessions_per_device = 5
//! command_timeout_secs = 30
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ttyhub_core::MAX_SLOTS;

/// Keepalive values a device may request, in seconds.
const KEEPALIVE_RANGE: std::ops::RangeInclusive<u16> = 1..=300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// All runtime configuration for the broker.
///
/// Build this once at startup and share it behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use ttyhub_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.device_bind_addr.port(), 5912);
/// assert_eq!(cfg.max_sessions_per_device, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Where devices dial in.
    pub device_bind_addr: SocketAddr,

    /// Where browsers open their terminal WebSocket.
    pub user_bind_addr: SocketAddr,

    /// Raw TCP listener for tunnelled HTTP traffic.
    pub proxy_bind_addr: SocketAddr,

    /// Public URL browsers are redirected to after a proxy redirect is
    /// issued.  Defaults to `http://<proxy_bind_addr>/`.
    pub proxy_public_url: Option<String>,

    /// Shared secret every device must present.  `None` accepts any device.
    pub device_token: Option<String>,

    /// Concurrent terminal sessions per device (1–10).
    pub max_sessions_per_device: u8,

    /// How long a command waits for its device response.  A resolved result
    /// stays collectable for the same amount of time again.
    pub command_timeout_secs: u64,

    /// Pending commands a single device may have before submits fail busy.
    pub max_pending_commands_per_device: usize,

    /// Keepalive used when a device does not request one.
    pub default_keepalive_secs: u16,

    /// Missed keepalive intervals before a device is considered dead.
    pub keepalive_miss_factor: u32,

    /// Time a new device connection has to send its Register frame.
    pub register_timeout_secs: u64,

    /// Time a browser has to send its login message, and time a device has
    /// to confirm a new session.
    pub login_timeout_secs: u64,

    /// Outbound frames buffered per device before it is declared unhealthy.
    pub device_queue_capacity: usize,

    /// Outbound messages buffered per browser before it is declared unhealthy.
    pub user_queue_capacity: usize,

    /// Events buffered in front of the broker loop.
    pub broker_queue_capacity: usize,

    /// Downstream chunks buffered per tunnel circuit.
    pub circuit_queue_capacity: usize,

    /// How long a connection reader may wait on a full broker queue.
    pub backpressure_timeout_ms: u64,

    /// Idle lifetime of a proxy session cookie.
    pub proxy_session_ttl_secs: u64,

    /// Interval of the expiring cache's background sweep.
    pub cache_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    /// | Field                            | Default         |
    /// |----------------------------------|-----------------|
    /// | device_bind_addr                 | `0.0.0.0:5912`  |
    /// | user_bind_addr                   | `0.0.0.0:5913`  |
    /// | proxy_bind_addr                  | `0.0.0.0:5914`  |
    /// | max_sessions_per_device          | 5               |
    /// | command_timeout_secs             | 30              |
    /// | max_pending_commands_per_device  | 16              |
    /// | default_keepalive_secs           | 5               |
    /// | keepalive_miss_factor            | 3               |
    /// | register / login timeout         | 5 s             |
    /// | proxy_session_ttl_secs           | 900             |
    fn default() -> Self {
        Self {
            device_bind_addr: SocketAddr::from(([0, 0, 0, 0], 5912)),
            user_bind_addr: SocketAddr::from(([0, 0, 0, 0], 5913)),
            proxy_bind_addr: SocketAddr::from(([0, 0, 0, 0], 5914)),
            proxy_public_url: None,
            device_token: None,
            max_sessions_per_device: 5,
            command_timeout_secs: 30,
            max_pending_commands_per_device: 16,
            default_keepalive_secs: 5,
            keepalive_miss_factor: 3,
            register_timeout_secs: 5,
            login_timeout_secs: 5,
            device_queue_capacity: 256,
            user_queue_capacity: 256,
            broker_queue_capacity: 1024,
            circuit_queue_capacity: 64,
            backpressure_timeout_ms: 1000,
            proxy_session_ttl_secs: 900,
            cache_sweep_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for syntax errors or unknown fields, and
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        let sessions = self.max_sessions_per_device as usize;
        if sessions == 0 || sessions > MAX_SLOTS {
            return Err(invalid(
                "max_sessions_per_device",
                format!("must be between 1 and {MAX_SLOTS}, got {sessions}"),
            ));
        }
        if !KEEPALIVE_RANGE.contains(&self.default_keepalive_secs) {
            return Err(invalid("default_keepalive_secs", "must be between 1 and 300"));
        }
        if self.keepalive_miss_factor < 2 {
            return Err(invalid("keepalive_miss_factor", "must be at least 2"));
        }

        let non_zero = [
            ("command_timeout_secs", self.command_timeout_secs),
            ("register_timeout_secs", self.register_timeout_secs),
            ("login_timeout_secs", self.login_timeout_secs),
            ("backpressure_timeout_ms", self.backpressure_timeout_ms),
            ("proxy_session_ttl_secs", self.proxy_session_ttl_secs),
            ("cache_sweep_interval_secs", self.cache_sweep_interval_secs),
            ("max_pending_commands_per_device", self.max_pending_commands_per_device as u64),
            ("device_queue_capacity", self.device_queue_capacity as u64),
            ("user_queue_capacity", self.user_queue_capacity as u64),
            ("broker_queue_capacity", self.broker_queue_capacity as u64),
            ("circuit_queue_capacity", self.circuit_queue_capacity as u64),
        ];
        if let Some((field, _)) = non_zero.into_iter().find(|(_, v)| *v == 0) {
            return Err(invalid(field, "must be greater than zero"));
        }

        if let Some(url) = &self.proxy_public_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid("proxy_public_url", "must start with http:// or https://"));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    pub fn proxy_session_ttl(&self) -> Duration {
        Duration::from_secs(self.proxy_session_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// The keepalive interval to use for a device that asked for `requested`
    /// seconds, clamped to a sane range.
    pub fn keepalive_for(&self, requested: Option<u16>) -> Duration {
        let secs = requested
            .unwrap_or(self.default_keepalive_secs)
            .clamp(*KEEPALIVE_RANGE.start(), *KEEPALIVE_RANGE.end());
        Duration::from_secs(u64::from(secs))
    }

    /// Silence after which a device with the given keepalive is dropped.
    pub fn dead_peer_after(&self, keepalive: Duration) -> Duration {
        keepalive * self.keepalive_miss_factor
    }

    /// Where proxy redirects send the browser, given the address the proxy
    /// listener actually bound.
    pub fn proxy_redirect_location(&self, bound: SocketAddr) -> String {
        match &self.proxy_public_url {
            Some(url) => url.clone(),
            None => format!("http://{bound}/"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
