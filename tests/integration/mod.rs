//! Integration tests for nsnet
//!
//! These tests drive a [`nsnet::HostNetwork`] from the sandbox side of its
//! transport, the way a tun pump inside the namespace would.
//!
//! # Test Organization
//!
//! - `peer`: a smoltcp interface standing in for the sandboxed process
//! - `bridge_transport`: packet-mode socket pair and the process handoff
//! - `udp_forwarding`: raw UDP datagrams relayed to host sockets and back
//! - `tcp_forwarding`: peer TCP connections spliced onto host listeners
//! - `config_loading`: configuration files feeding a running host network
//!
//! # Test Requirements
//!
//! - No network access; every destination is a listener on 127.0.0.1
//! - `/bin/sh` for the fd handoff test

pub mod bridge_transport;
pub mod config_loading;
pub mod peer;
pub mod tcp_forwarding;
pub mod udp_forwarding;
