//! Configuration types
//!
//! The configuration is immutable after load. Values are resolved with the
//! precedence: built-in defaults, then the options file, then environment
//! variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host of the remote serial bridge (required)
    #[serde(default)]
    pub upstream_host: String,

    /// Port of the remote serial bridge
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Local port to accept proxy clients on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Hard cap on concurrent downstream connections (proxy + web combined)
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Whether inbound/outbound bytes are emitted to the hex packet log
    #[serde(default)]
    pub log_packets: bool,

    /// Append-only sink for the hex packet log; empty disables the file sink
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Port the external web control plane listens on
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Initial reconnect backoff in seconds
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,

    /// Reconnect backoff cap in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

fn default_upstream_port() -> u16 {
    8899
}

fn default_listen_port() -> u16 {
    18899
}

fn default_max_clients() -> usize {
    10
}

fn default_log_file() -> String {
    "/data/packets.log".into()
}

fn default_web_port() -> u16 {
    18080
}

fn default_reconnect_initial_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_host: String::new(),
            upstream_port: default_upstream_port(),
            listen_port: default_listen_port(),
            max_clients: default_max_clients(),
            log_packets: false,
            log_file: default_log_file(),
            web_port: default_web_port(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when a required field is
    /// missing or a value is outside its permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_host.is_empty() {
            return Err(ConfigError::validation("UPSTREAM_HOST is required"));
        }
        if self.upstream_port == 0 {
            return Err(ConfigError::validation(format!(
                "invalid UPSTREAM_PORT: {}",
                self.upstream_port
            )));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::validation(format!(
                "invalid LISTEN_PORT: {}",
                self.listen_port
            )));
        }
        if self.max_clients == 0 || self.max_clients > 100 {
            return Err(ConfigError::validation(
                "MAX_CLIENTS must be between 1 and 100",
            ));
        }
        if self.reconnect_initial_secs == 0 {
            return Err(ConfigError::validation("RECONNECT_DELAY must be > 0"));
        }
        if self.reconnect_max_secs < self.reconnect_initial_secs {
            return Err(ConfigError::validation(
                "reconnect backoff cap must be >= the initial delay",
            ));
        }
        Ok(())
    }

    /// host:port of the remote serial bridge
    #[must_use]
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Local accept endpoint
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    /// Initial reconnect backoff
    #[must_use]
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs)
    }

    /// Reconnect backoff cap
    #[must_use]
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    /// Projection of the configuration safe for external display
    #[must_use]
    pub fn public_view(&self) -> PublicConfig {
        PublicConfig {
            upstream_host: self.upstream_host.clone(),
            upstream_port: self.upstream_port,
            listen_port: self.listen_port,
            max_clients: self.max_clients,
            log_packets: self.log_packets,
            web_port: self.web_port,
        }
    }
}

/// Subset of the configuration exposed to the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicConfig {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub listen_port: u16,
    pub max_clients: usize,
    pub log_packets: bool,
    pub web_port: u16,
}
