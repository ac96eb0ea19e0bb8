//! Configuration loading
//!
//! Configuration comes from an optional JSON file, then environment
//! variable overrides, then validation.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Environment variable overriding `log.level`
pub const ENV_LOG_LEVEL: &str = "NSNET_LOG_LEVEL";
/// Environment variable overriding `options.udp.threads`
pub const ENV_UDP_THREADS: &str = "NSNET_UDP_THREADS";
/// Environment variable overriding `options.udp.queue_size`
pub const ENV_UDP_QUEUE_SIZE: &str = "NSNET_UDP_QUEUE_SIZE";
/// Environment variable overriding `options.tcp.max_conns`
pub const ENV_TCP_MAX_CONNS: &str = "NSNET_TCP_MAX_CONNS";
/// Environment variable enabling statistics for both forwarders
pub const ENV_STATS: &str = "NSNET_STATS";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: mtu={}, udp threads={}, tcp max_conns={}",
        config.options.network.mtu, config.options.udp.threads, config.options.tcp.max_conns
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Without a path the defaults are used as the base. Environment variables:
/// - `NSNET_LOG_LEVEL`: override log level
/// - `NSNET_UDP_THREADS`: override UDP worker count
/// - `NSNET_UDP_QUEUE_SIZE`: override UDP queue capacity
/// - `NSNET_TCP_MAX_CONNS`: override the TCP flow limit
/// - `NSNET_STATS`: `1`/`true` enables statistics
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Apply overrides using `lookup` to read variables
///
/// # Errors
///
/// Returns `ConfigError::EnvError` if a variable holds an invalid value.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(value) = lookup(ENV_UDP_THREADS) {
        config.options.udp.threads = parse_env(ENV_UDP_THREADS, &value)?;
        debug!("UDP threads overridden to {}", config.options.udp.threads);
    }

    if let Some(value) = lookup(ENV_UDP_QUEUE_SIZE) {
        config.options.udp.queue_size = parse_env(ENV_UDP_QUEUE_SIZE, &value)?;
        debug!("UDP queue size overridden to {}", config.options.udp.queue_size);
    }

    if let Some(value) = lookup(ENV_TCP_MAX_CONNS) {
        config.options.tcp.max_conns = parse_env(ENV_TCP_MAX_CONNS, &value)?;
        debug!("TCP max conns overridden to {}", config.options.tcp.max_conns);
    }

    if let Some(value) = lookup(ENV_STATS) {
        let enabled = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                return Err(ConfigError::EnvError {
                    name: ENV_STATS.into(),
                    reason: format!("Invalid boolean: {value}"),
                })
            }
        };
        config.options = std::mem::take(&mut config.options).with_stats(enabled);
        debug!("Statistics overridden to {}", enabled);
    }

    Ok(())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::EnvError {
        name: name.into(),
        reason: format!("Invalid number: {value}"),
    })
}

/// Write the default configuration to `path`
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default())
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
