//! Resolved routes and the network-header write primitive

use std::net::IpAddr;
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr};

use super::checksum;
use super::link::LinkCapabilities;
use super::packet::{NetworkProtocol, PacketBuffer, TransportProtocol, IPV4_HEADER_LEN, IPV6_HEADER_LEN};
use super::{Nic, NicId, DEFAULT_TTL};
use crate::error::StackError;

/// Parameters of the network header written in front of a packet
#[derive(Debug, Clone, Copy)]
pub struct NetworkHeaderParams {
    pub protocol: TransportProtocol,
    pub ttl: u8,
    pub tos: u8,
}

/// A resolved path from a local address to a remote one through a NIC
#[derive(Clone)]
pub struct Route {
    local_addr: IpAddr,
    remote_addr: IpAddr,
    net_proto: NetworkProtocol,
    nic: Arc<Nic>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("net_proto", &self.net_proto)
            .field("nic", &self.nic.id)
            .finish()
    }
}

impl Route {
    pub(super) fn new(local_addr: IpAddr, remote_addr: IpAddr, net_proto: NetworkProtocol, nic: Arc<Nic>) -> Self {
        Self {
            local_addr,
            remote_addr,
            net_proto,
            nic,
        }
    }

    #[must_use]
    pub const fn local_addr(&self) -> IpAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    #[must_use]
    pub fn nic_id(&self) -> NicId {
        self.nic.id
    }

    #[must_use]
    pub const fn net_proto(&self) -> NetworkProtocol {
        self.net_proto
    }

    #[must_use]
    pub const fn default_ttl(&self) -> u8 {
        DEFAULT_TTL
    }

    /// Headroom needed below the transport header: network plus link headers
    #[must_use]
    pub fn max_header_length(&self) -> usize {
        self.net_proto.header_len() + usize::from(self.nic.link.max_header_length())
    }

    /// Largest transport segment that fits the link MTU
    #[must_use]
    pub fn mtu(&self) -> usize {
        (self.nic.link.mtu() as usize).saturating_sub(self.net_proto.header_len())
    }

    /// Whether transport checksums must be computed in software
    #[must_use]
    pub fn requires_tx_transport_checksum(&self) -> bool {
        !self
            .nic
            .link
            .capabilities()
            .contains(LinkCapabilities::TX_CHECKSUM_OFFLOAD)
    }

    /// Unfolded pseudo-header sum for a transport segment of `length` bytes
    #[must_use]
    pub fn pseudo_header_checksum(&self, protocol: TransportProtocol, length: u16) -> u32 {
        checksum::pseudo_header(self.local_addr, self.remote_addr, protocol, u32::from(length))
    }

    /// Prepend the network header and hand the packet to the NIC's link
    pub async fn write_packet(&self, params: NetworkHeaderParams, mut packet: PacketBuffer) -> Result<(), StackError> {
        let payload_len = packet.len();
        let mtu = self.nic.link.mtu() as usize;
        if payload_len + self.net_proto.header_len() > mtu {
            return Err(StackError::PacketTooBig {
                len: payload_len + self.net_proto.header_len(),
                mtu,
            });
        }

        match (self.local_addr, self.remote_addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let repr = Ipv4Repr {
                    src_addr: src.into(),
                    dst_addr: dst.into(),
                    next_header: params.protocol.ip_protocol(),
                    payload_len,
                    hop_limit: params.ttl,
                };
                let mut header = Ipv4Packet::new_unchecked(packet.push_network_header(IPV4_HEADER_LEN));
                repr.emit(&mut header, &ChecksumCapabilities::default());
                if params.tos != 0 {
                    header.set_dscp(params.tos >> 2);
                    header.set_ecn(params.tos & 0x3);
                    header.fill_checksum();
                }
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let repr = Ipv6Repr {
                    src_addr: src.into(),
                    dst_addr: dst.into(),
                    next_header: params.protocol.ip_protocol(),
                    payload_len,
                    hop_limit: params.ttl,
                };
                let mut header = Ipv6Packet::new_unchecked(packet.push_network_header(IPV6_HEADER_LEN));
                repr.emit(&mut header);
                header.set_traffic_class(params.tos);
            }
            (local, remote) => return Err(StackError::AddressFamilyMismatch { local, remote }),
        }

        self.nic.link.write_packet(self.net_proto, packet).await
    }
}
