//! Configuration module for nsnet
//!
//! # Example
//!
//! ```no_run
//! use nsnet::config::load_config;
//!
//! let config = load_config("/etc/nsnet/config.json").unwrap();
//! println!("UDP workers: {}", config.options.udp.threads);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str, load_config_with_env, ENV_LOG_LEVEL,
    ENV_STATS, ENV_TCP_MAX_CONNS, ENV_UDP_QUEUE_SIZE, ENV_UDP_THREADS,
};
pub use types::{Config, LogConfig, NetworkOptions, Options, TcpOptions, UdpOptions};
