//! Packet buffers, protocol numbers and flow identifiers
//!
//! A [`PacketBuffer`] carries one IP datagram. Outbound packets are built
//! back to front: the payload is placed after reserved headroom and each
//! layer pushes its header in front of the previous one. Inbound packets are
//! parsed once by the stack, which records where each header starts.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use smoltcp::wire::IpProtocol;

/// IPv4 header length without options
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Network-layer protocol of a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Ethertype number of the protocol
    #[must_use]
    pub const fn number(self) -> u16 {
        match self {
            Self::Ipv4 => 0x0800,
            Self::Ipv6 => 0x86DD,
        }
    }

    /// Length of the header this stack emits for the protocol
    #[must_use]
    pub const fn header_len(self) -> usize {
        match self {
            Self::Ipv4 => IPV4_HEADER_LEN,
            Self::Ipv6 => IPV6_HEADER_LEN,
        }
    }

    /// Protocol matching the version nibble of a raw datagram
    #[must_use]
    pub fn from_datagram(data: &[u8]) -> Option<Self> {
        match data.first().map(|b| b >> 4) {
            Some(4) => Some(Self::Ipv4),
            Some(6) => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Protocol of an address
    #[must_use]
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Transport-layer protocol handled by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    /// IANA protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    pub(crate) const fn ip_protocol(self) -> IpProtocol {
        match self {
            Self::Tcp => IpProtocol::Tcp,
            Self::Udp => IpProtocol::Udp,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Four-tuple identifying a flow, seen from the stack
///
/// The stack terminates traffic on behalf of every destination, so the
/// *local* half is the address the sandboxed peer sent to and the *remote*
/// half is the peer's own source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

impl TransportEndpointId {
    /// Destination requested by the peer
    #[must_use]
    pub const fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }

    /// Source used by the peer
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_addr, self.remote_port)
    }

    /// Network protocol of the flow, taken from the local address
    #[must_use]
    pub const fn net_proto(&self) -> NetworkProtocol {
        NetworkProtocol::of(&self.local_addr)
    }
}

impl fmt::Display for TransportEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.local_addr, self.local_port, self.remote_addr, self.remote_port
        )
    }
}

/// One IP datagram with header offsets
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    head: usize,
    network: Option<usize>,
    transport: Option<usize>,
    payload: usize,
}

impl PacketBuffer {
    /// Build an outbound packet with `headroom` bytes reserved for headers
    #[must_use]
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = vec![0u8; headroom + payload.len()];
        buf[headroom..].copy_from_slice(payload);
        Self {
            buf,
            head: headroom,
            network: None,
            transport: None,
            payload: headroom,
        }
    }

    /// Wrap a received datagram whose headers were already located
    pub(crate) fn inbound(buf: Vec<u8>, transport: usize, payload: usize) -> Self {
        Self {
            buf,
            head: 0,
            network: Some(0),
            transport: Some(transport),
            payload,
        }
    }

    /// Wrap a raw datagram without parsing it
    #[must_use]
    pub fn from_datagram(buf: Vec<u8>) -> Self {
        let payload = buf.len();
        Self {
            buf,
            head: 0,
            network: Some(0),
            transport: None,
            payload,
        }
    }

    /// Bytes of headroom left in front of the outermost header
    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.head
    }

    /// Push a transport header of `len` bytes and return it zeroed
    pub fn push_transport_header(&mut self, len: usize) -> &mut [u8] {
        let start = self.push(len);
        self.transport = Some(start);
        &mut self.buf[start..start + len]
    }

    /// Push a network header of `len` bytes and return it zeroed
    pub fn push_network_header(&mut self, len: usize) -> &mut [u8] {
        let start = self.push(len);
        self.network = Some(start);
        &mut self.buf[start..start + len]
    }

    fn push(&mut self, len: usize) -> usize {
        if len > self.head {
            let grow = len - self.head;
            self.buf.splice(0..0, std::iter::repeat(0u8).take(grow));
            self.head += grow;
            self.payload += grow;
            self.network = self.network.map(|o| o + grow);
            self.transport = self.transport.map(|o| o + grow);
        }
        self.head -= len;
        self.buf[self.head..self.head + len].fill(0);
        self.head
    }

    /// Network header bytes, if one was pushed or parsed
    #[must_use]
    pub fn network_header(&self) -> &[u8] {
        match self.network {
            Some(start) => &self.buf[start..self.transport.unwrap_or(self.payload)],
            None => &[],
        }
    }

    /// Transport header bytes, if one was pushed or parsed
    #[must_use]
    pub fn transport_header(&self) -> &[u8] {
        match self.transport {
            Some(start) => &self.buf[start..self.payload],
            None => &[],
        }
    }

    /// Bytes following the transport header
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload..]
    }

    /// Transport header and payload as one slice
    #[must_use]
    pub fn transport_segment(&self) -> &[u8] {
        &self.buf[self.transport.unwrap_or(self.payload)..]
    }

    /// Whole packet as one contiguous view
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Total length of the packet
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    /// Whether the packet holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the buffer, returning the flattened datagram
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.head > 0 {
            self.buf.drain(..self.head);
        }
        self.buf
    }
}
