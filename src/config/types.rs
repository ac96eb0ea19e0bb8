//! Configuration types for nsnet
//!
//! Every field carries a serde default, so an empty JSON object is a valid
//! configuration describing the stock setup.

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Forwarding options
    #[serde(default)]
    pub options: Options,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.options.validate()?;
        self.log.validate()
    }
}

/// Options captured when the host network is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Options {
    #[serde(default)]
    pub udp: UdpOptions,

    #[serde(default)]
    pub tcp: TcpOptions,

    #[serde(default)]
    pub network: NetworkOptions,
}

impl Options {
    /// Validate all option groups
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.udp.validate()?;
        self.tcp.validate()?;
        self.network.validate()
    }

    /// Enable or disable statistics for both forwarders
    #[must_use]
    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.udp.stats = enabled;
        self.tcp.stats = enabled;
        self
    }
}

/// UDP forwarder options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UdpOptions {
    /// Capacity of the inbound datagram queue
    #[serde(default = "default_udp_queue_size")]
    pub queue_size: usize,

    /// Number of workers draining the queue
    #[serde(default = "default_udp_threads")]
    pub threads: usize,

    /// Collect statistics
    #[serde(default)]
    pub stats: bool,

    /// Idle time after which a flow's host socket is closed
    #[serde(default = "default_udp_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            queue_size: default_udp_queue_size(),
            threads: default_udp_threads(),
            stats: false,
            timeout_secs: default_udp_timeout_secs(),
        }
    }
}

impl UdpOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::ValidationError("udp.queue_size must be positive".into()));
        }
        if self.threads == 0 {
            return Err(ConfigError::ValidationError("udp.threads must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError("udp.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// TCP forwarder options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TcpOptions {
    /// Maximum number of live TCP flows
    #[serde(default = "default_tcp_max_conns")]
    pub max_conns: usize,

    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Collect statistics
    #[serde(default)]
    pub stats: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            max_conns: default_tcp_max_conns(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            stats: false,
        }
    }
}

impl TcpOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conns == 0 {
            return Err(ConfigError::ValidationError("tcp.max_conns must be positive".into()));
        }
        if self.keepalive_idle_secs == 0 || self.keepalive_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tcp keepalive idle and interval must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Virtual link and stack addressing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkOptions {
    /// Link MTU shared with the peer's tun device
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Gateway address of the stack as seen by the peer
    #[serde(default = "default_ipv4_address")]
    pub ipv4_address: Ipv4Net,

    /// IPv6 address of the stack, `null` to run IPv4 only
    #[serde(default = "default_ipv6_address")]
    pub ipv6_address: Option<Ipv6Net>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            ipv4_address: default_ipv4_address(),
            ipv6_address: default_ipv6_address(),
        }
    }
}

impl NetworkOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::ValidationError(format!(
                "network.mtu must be within {MIN_MTU}..={MAX_MTU}, got {}",
                self.mtu
            )));
        }
        if self.ipv4_address.addr().is_unspecified() {
            return Err(ConfigError::ValidationError(
                "network.ipv4_address must not be unspecified".into(),
            ));
        }
        if let Some(v6) = self.ipv6_address {
            if self.mtu < MIN_IPV6_MTU {
                return Err(ConfigError::ValidationError(format!(
                    "IPv6 requires an MTU of at least {MIN_IPV6_MTU}"
                )));
            }
            if v6.addr().is_unspecified() {
                return Err(ConfigError::ValidationError(
                    "network.ipv6_address must not be unspecified".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include module targets in log lines
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "text" | "json") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

const MIN_MTU: u32 = 576;
const MIN_IPV6_MTU: u32 = 1280;
const MAX_MTU: u32 = 65535;

// Default value functions for serde
const fn default_udp_queue_size() -> usize {
    4096
}

const fn default_udp_threads() -> usize {
    16
}

const fn default_udp_timeout_secs() -> u64 {
    60
}

const fn default_tcp_max_conns() -> usize {
    2048
}

const fn default_keepalive_idle_secs() -> u64 {
    60
}

const fn default_keepalive_interval_secs() -> u64 {
    30
}

const fn default_mtu() -> u32 {
    1500
}

fn default_ipv4_address() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 1), 24).unwrap_or_default()
}

fn default_ipv6_address() -> Option<Ipv6Net> {
    Ipv6Net::new(std::net::Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), 64).ok()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
