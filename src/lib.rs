//! nsnet: user-space networking for sandboxed processes
//!
//! This crate gives an isolated process network access without a real
//! interface. The process's IP datagrams arrive over a packet-mode socket,
//! are terminated by a user-space TCP/IP stack, and every TCP connection or
//! UDP flow is re-originated from the host's own sockets.
//!
//! # Architecture
//!
//! ```text
//! sandbox tun → SeqPacket (fd 3) → BridgeEndpoint → Stack → TcpForwarder → host TCP
//!                                                         ↘ UdpForwarder → host UDP
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use nsnet::config::Options;
//! use nsnet::HostNetwork;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut host = HostNetwork::new(Options::default().with_stats(true))?;
//!
//! let mut command = tokio::process::Command::new("sandbox-init");
//! host.attach_to_command(&mut command)?;
//! let mut child = command.spawn()?;
//! host.release_peer_fd();
//!
//! child.wait().await?;
//! println!("{:?}", host.tcp_stats());
//! host.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`bridge`]: Virtual NIC over a packet transport
//! - [`config`]: Options and configuration loading
//! - [`error`]: Error types
//! - [`forward`]: TCP and UDP forwarders
//! - [`host`]: Host network handle
//! - [`io`]: Bidirectional copy
//! - [`stack`]: User-space protocol stack
//! - [`stats`]: Forwarder counters
//! - [`transport`]: Packet-mode socket pair

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod forward;
pub mod host;
pub mod io;
pub mod stack;
pub mod stats;
pub mod transport;

// Re-export commonly used types at the crate root
pub use bridge::BridgeEndpoint;
pub use config::{Config, Options, TcpOptions, UdpOptions};
pub use error::{ConfigError, NsNetError, StackError};
pub use forward::{TcpForwarder, UdpForwarder};
pub use host::{HostNetwork, NIC_ID, PEER_FD};
pub use stats::{TcpStatsSnapshot, UdpStatsSnapshot};
pub use transport::{PacketTransport, SeqPacket};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
