//! Sandbox-side peer for integration tests
//!
//! Runs its own smoltcp interface (10.0.0.2/24, default route via 10.0.0.1)
//! over the far end of a `UnixDatagram` pair and also crafts raw IPv4 and
//! IPv6 UDP datagrams for tests that bypass a socket layer.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr,
    UdpPacket, UdpRepr,
};
use tokio::net::UnixDatagram;

use nsnet::stack::device::{PacketQueue, StackDevice};

/// Address the peer's interface carries
pub const PEER_ADDR: [u8; 4] = [10, 0, 0, 2];

const MTU: usize = 1500;
const TICK: Duration = Duration::from_millis(5);

/// smoltcp interface pumped over a datagram socket
pub struct Peer {
    link: UnixDatagram,
    queue: PacketQueue,
    iface: Interface,
    sockets: SocketSet<'static>,
    epoch: Instant,
}

impl Peer {
    pub fn new(link: UnixDatagram) -> Self {
        let epoch = Instant::now();
        let mut queue = PacketQueue::new();
        let mut iface = {
            let mut device = StackDevice::new(&mut queue, MTU);
            Interface::new(IfaceConfig::new(HardwareAddress::Ip), &mut device, SmolInstant::from_micros(0))
        };
        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(IpAddress::v4(10, 0, 0, 2), 24))
                .unwrap();
        });
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::new(10, 0, 0, 1))
            .unwrap();

        Self {
            link,
            queue,
            iface,
            sockets: SocketSet::new(Vec::new()),
            epoch,
        }
    }

    /// Open a TCP connection to `remote` from `local_port`
    pub fn connect(&mut self, remote: SocketAddrV4, local_port: u16) -> SocketHandle {
        let socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; 64 * 1024]),
            tcp::SocketBuffer::new(vec![0; 64 * 1024]),
        );
        let handle = self.sockets.add(socket);
        let remote = (IpAddress::Ipv4((*remote.ip()).into()), remote.port());
        self.sockets
            .get_mut::<tcp::Socket>(handle)
            .connect(self.iface.context(), remote, local_port)
            .unwrap();
        handle
    }

    /// Pump packets until `done` holds or `limit` passes
    pub async fn drive_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&mut SocketSet<'static>) -> bool,
    {
        let deadline = Instant::now() + limit;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let now = self.now();
            {
                let mut device = StackDevice::new(&mut self.queue, MTU);
                self.iface.poll(now, &mut device, &mut self.sockets);
            }
            for packet in self.queue.drain_tx() {
                self.link.send(&packet).await.unwrap();
            }

            if done(&mut self.sockets) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            let wait = self
                .iface
                .poll_delay(now, &self.sockets)
                .map_or(TICK, |d| Duration::from_micros(d.total_micros()))
                .min(TICK);
            if let Ok(Ok(n)) = tokio::time::timeout(wait, self.link.recv(&mut buf)).await {
                self.queue.push_rx(buf[..n].to_vec());
                while let Ok(n) = self.link.try_recv(&mut buf) {
                    self.queue.push_rx(buf[..n].to_vec());
                }
            }
        }
    }

    fn now(&self) -> SmolInstant {
        SmolInstant::from_micros(self.epoch.elapsed().as_micros() as i64)
    }
}

/// Build an IPv4 UDP datagram with valid checksums
pub fn udp_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip = Ipv4Repr {
        src_addr: (*src.ip()).into(),
        dst_addr: (*dst.ip()).into(),
        next_header: IpProtocol::Udp,
        payload_len: udp.header_len() + payload.len(),
        hop_limit: 64,
    };
    let caps = ChecksumCapabilities::default();

    let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
    let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut packet, &caps);
    let mut datagram = UdpPacket::new_unchecked(packet.payload_mut());
    udp.emit(
        &mut datagram,
        &IpAddress::Ipv4(ip.src_addr),
        &IpAddress::Ipv4(ip.dst_addr),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );
    buf
}

/// A parsed IPv4 UDP datagram
#[derive(Debug)]
pub struct UdpReply {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

/// Parse an IPv4 UDP datagram, `None` for anything else
pub fn parse_udp(buf: &[u8]) -> Option<UdpReply> {
    let packet = Ipv4Packet::new_checked(buf).ok()?;
    if packet.next_header() != IpProtocol::Udp {
        return None;
    }
    let datagram = UdpPacket::new_checked(packet.payload()).ok()?;
    Some(UdpReply {
        src: SocketAddrV4::new(packet.src_addr().into(), datagram.src_port()),
        dst: SocketAddrV4::new(packet.dst_addr().into(), datagram.dst_port()),
        checksum: datagram.checksum(),
        payload: datagram.payload().to_vec(),
    })
}

/// Build an IPv6 UDP datagram with a valid checksum
pub fn udp6_datagram(src: SocketAddrV6, dst: SocketAddrV6, payload: &[u8]) -> Vec<u8> {
    let udp = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip = Ipv6Repr {
        src_addr: (*src.ip()).into(),
        dst_addr: (*dst.ip()).into(),
        next_header: IpProtocol::Udp,
        payload_len: udp.header_len() + payload.len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
    let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut packet);
    let mut datagram = UdpPacket::new_unchecked(packet.payload_mut());
    udp.emit(
        &mut datagram,
        &IpAddress::Ipv6(ip.src_addr),
        &IpAddress::Ipv6(ip.dst_addr),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    buf
}

/// A parsed IPv6 UDP datagram with its raw UDP segment
#[derive(Debug)]
pub struct Udp6Reply {
    pub src: SocketAddrV6,
    pub dst: SocketAddrV6,
    pub checksum: u16,
    pub payload: Vec<u8>,
    pub segment: Vec<u8>,
}

/// Parse an IPv6 UDP datagram, `None` for anything else
pub fn parse_udp6(buf: &[u8]) -> Option<Udp6Reply> {
    let packet = Ipv6Packet::new_checked(buf).ok()?;
    if packet.next_header() != IpProtocol::Udp {
        return None;
    }
    let datagram = UdpPacket::new_checked(packet.payload()).ok()?;
    Some(Udp6Reply {
        src: SocketAddrV6::new(packet.src_addr().into(), datagram.src_port(), 0, 0),
        dst: SocketAddrV6::new(packet.dst_addr().into(), datagram.dst_port(), 0, 0),
        checksum: datagram.checksum(),
        payload: datagram.payload().to_vec(),
        segment: packet.payload().to_vec(),
    })
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes
pub async fn wait_for<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
