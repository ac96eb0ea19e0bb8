//! Error types for nsnet
//!
//! Errors are split by the layer they originate from: configuration, the
//! user-space protocol stack, and the top-level host network handle. Per-flow
//! failures never surface here; forwarders log and drop them.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Top-level error type for nsnet
#[derive(Debug, Error)]
pub enum NsNetError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Stack configuration failed while building the host network
    #[error("Setup error: {0}")]
    Setup(String),

    /// The packet transport to the sandboxed peer failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NsNetError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Setup(_) => false,
            Self::Transport(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Wrap a stack error raised while wiring the host network
    pub fn setup(context: &str, err: StackError) -> Self {
        Self::Setup(format!("{context}: {err}"))
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors reported by the user-space protocol stack
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// NIC id is not registered
    #[error("unknown NIC {0}")]
    UnknownNic(u32),

    /// NIC id is already registered
    #[error("duplicate NIC id {0}")]
    DuplicateNicId(u32),

    /// Protocol was not enabled when the stack was built
    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    /// No route matches the destination
    #[error("no route to {0}")]
    NoRoute(IpAddr),

    /// Local address is not owned by the NIC and spoofing is disabled
    #[error("bad local address {0}")]
    BadLocalAddress(IpAddr),

    /// Address cannot be used for the requested operation
    #[error("bad address {0}")]
    BadAddress(IpAddr),

    /// Local and remote addresses belong to different families
    #[error("address family mismatch between {local} and {remote}")]
    AddressFamilyMismatch { local: IpAddr, remote: IpAddr },

    /// Link endpoint is detached or its transport failed
    #[error("endpoint is in an invalid state")]
    InvalidEndpointState,

    /// Operation is not supported by the endpoint
    #[error("operation not supported")]
    NotSupported,

    /// Connection was refused by the stack
    #[error("connection refused")]
    ConnectionRefused,

    /// Connection limit reached
    #[error("too many connections ({current}/{max})")]
    TooManyConnections { current: usize, max: usize },

    /// Packet exceeds the link MTU
    #[error("packet of {len} bytes exceeds MTU {mtu}")]
    PacketTooBig { len: usize, mtu: usize },
}

impl StackError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidEndpointState | Self::ConnectionRefused | Self::TooManyConnections { .. }
        )
    }
}

/// Type alias for Result with `NsNetError`
pub type Result<T> = std::result::Result<T, NsNetError>;
