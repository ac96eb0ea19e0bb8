//! Host network handle
//!
//! [`HostNetwork`] owns everything that gives a sandboxed process its
//! network: the packet transport, the bridge endpoint, the protocol stack and
//! both forwarders.
//!
//! ```text
//!  sandbox tun <== fd 3 ==> SeqPacket --> BridgeEndpoint --> Stack --+--> TcpForwarder --> host TCP
//!                                                                    +--> UdpForwarder --> host UDP
//! ```

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tokio::process::Command;
use tracing::{debug, info};

use crate::bridge::BridgeEndpoint;
use crate::config::Options;
use crate::error::{NsNetError, Result};
use crate::forward::{TcpForwarder, UdpForwarder};
use crate::stack::packet::NetworkProtocol;
use crate::stack::{NicId, ProtocolAddress, RouteEntry, Stack, StackOptions};
use crate::stats::{TcpStatsSnapshot, UdpStatsSnapshot};
use crate::transport::{PacketTransport, SeqPacket};

/// NIC id of the bridge endpoint inside the stack
pub const NIC_ID: NicId = 1;

/// File descriptor number the sandboxed peer finds its transport at
pub const PEER_FD: RawFd = 3;

/// A running host-side network for one sandboxed peer
pub struct HostNetwork {
    stack: Stack,
    transport: Arc<dyn PacketTransport>,
    peer_fd: Option<OwnedFd>,
    tcp: TcpForwarder,
    udp: UdpForwarder,
}

impl std::fmt::Debug for HostNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostNetwork")
            .field("stack", &self.stack)
            .field("peer_fd", &self.peer_fd)
            .field("tcp", &self.tcp)
            .field("udp", &self.udp)
            .finish_non_exhaustive()
    }
}

impl HostNetwork {
    /// Create a socket pair and a host network serving its host end
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `NsNetError::Config` for invalid options, `NsNetError::Transport`
    /// if the socket pair cannot be created and `NsNetError::Setup` if the
    /// stack cannot be wired.
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;
        let (transport, peer_fd) =
            SeqPacket::pair().map_err(|e| NsNetError::Transport(format!("cannot create socket pair: {e}")))?;
        let mut host = Self::with_transport(options, Arc::new(transport))?;
        host.peer_fd = Some(peer_fd);
        Ok(host)
    }

    /// Create a host network over an existing transport
    ///
    /// # Errors
    ///
    /// Same as [`HostNetwork::new`], minus transport creation.
    pub fn with_transport<T: PacketTransport>(options: Options, transport: Arc<T>) -> Result<Self> {
        options.validate()?;

        let stack = Stack::new(StackOptions::default());
        let link = Arc::new(BridgeEndpoint::new(Arc::clone(&transport), options.network.mtu));

        let (tcp, udp) = match wire(&stack, link, &options) {
            Ok(forwarders) => forwarders,
            Err(e) => {
                stack.close();
                return Err(e);
            }
        };

        info!(
            "host network up: {} mtu {}, udp workers {}, tcp max conns {}",
            options.network.ipv4_address, options.network.mtu, options.udp.threads, options.tcp.max_conns
        );

        Ok(Self {
            stack,
            transport,
            peer_fd: None,
            tcp,
            udp,
        })
    }

    /// Shut the transport down and close both forwarders
    ///
    /// # Errors
    ///
    /// Returns `NsNetError::Transport` if the transport cannot be shut down;
    /// the forwarders and the stack are closed regardless.
    pub fn close(&self) -> Result<()> {
        let transport = self
            .transport
            .shutdown()
            .map_err(|e| NsNetError::Transport(format!("transport shutdown failed: {e}")));
        self.tcp.close();
        self.udp.close();
        self.stack.close();
        debug!("host network closed");
        transport
    }

    /// Make the peer end of the transport available to `command` as fd 3
    ///
    /// # Errors
    ///
    /// Returns `NsNetError::Transport` if the peer fd was already released or
    /// the host network was built over a custom transport.
    pub fn attach_to_command(&self, command: &mut Command) -> Result<()> {
        let fd = self
            .peer_fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| NsNetError::Transport("no peer fd to pass".into()))?;

        // SAFETY: This is safe because:
        // 1. The closure runs in the forked child before exec and only calls
        //    async-signal-safe functions (`fcntl`, `dup2`)
        // 2. `fd` stays open in the parent until the child is spawned, so the
        //    child inherits a valid descriptor
        // 3. No memory is allocated or locks are taken in the closure
        unsafe {
            command.pre_exec(move || {
                if fd == PEER_FD {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, PEER_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }

    /// Peer end of the transport, while the parent still holds it
    pub fn peer_fd(&self) -> Option<BorrowedFd<'_>> {
        self.peer_fd.as_ref().map(AsFd::as_fd)
    }

    /// Drop the parent's copy of the peer fd
    ///
    /// Once the child holding the other copy exits, the bridge sees EOF.
    pub fn release_peer_fd(&mut self) -> Option<OwnedFd> {
        self.peer_fd.take()
    }

    /// The protocol stack serving the peer
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// TCP counters, `None` when TCP statistics are disabled
    pub fn tcp_stats(&self) -> Option<TcpStatsSnapshot> {
        self.tcp.stats()
    }

    /// UDP counters, `None` when UDP statistics are disabled
    pub fn udp_stats(&self) -> Option<UdpStatsSnapshot> {
        self.udp.stats()
    }
}

/// Register the forwarders, then bring the NIC up with its addresses
fn wire<T: PacketTransport>(
    stack: &Stack,
    link: Arc<BridgeEndpoint<T>>,
    options: &Options,
) -> Result<(TcpForwarder, UdpForwarder)> {
    let tcp = TcpForwarder::new(stack, options.tcp.clone()).map_err(|e| NsNetError::setup("TCP forwarder", e))?;
    let udp = UdpForwarder::new(stack, NIC_ID, options.udp.clone()).map_err(|e| NsNetError::setup("UDP forwarder", e))?;

    stack.add_route(RouteEntry {
        destination: IpNet::V4(Ipv4Net::default()),
        nic: NIC_ID,
    });
    stack.add_route(RouteEntry {
        destination: IpNet::V6(Ipv6Net::default()),
        nic: NIC_ID,
    });

    stack
        .create_nic(NIC_ID, link)
        .map_err(|e| NsNetError::setup("create NIC", e))?;
    stack
        .add_protocol_address(
            NIC_ID,
            ProtocolAddress {
                protocol: NetworkProtocol::Ipv4,
                address: IpNet::V4(options.network.ipv4_address),
            },
        )
        .map_err(|e| NsNetError::setup("IPv4 address", e))?;
    if let Some(address) = options.network.ipv6_address {
        stack
            .add_protocol_address(
                NIC_ID,
                ProtocolAddress {
                    protocol: NetworkProtocol::Ipv6,
                    address: IpNet::V6(address),
                },
            )
            .map_err(|e| NsNetError::setup("IPv6 address", e))?;
    }
    stack
        .set_promiscuous_mode(NIC_ID, true)
        .map_err(|e| NsNetError::setup("promiscuous mode", e))?;
    stack
        .set_spoofing(NIC_ID, true)
        .map_err(|e| NsNetError::setup("spoofing", e))?;

    Ok((tcp, udp))
}
