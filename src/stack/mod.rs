//! User-space protocol stack
//!
//! The stack terminates TCP and UDP on behalf of every destination the
//! sandboxed peer talks to. TCP state is owned by a smoltcp [`Interface`];
//! UDP never enters smoltcp and is handed to the registered UDP handler.
//!
//! # Architecture
//!
//! ```text
//!  LinkEndpoint --deliver--> Stack demux --+--> TransportHandler (new TCP flow / UDP)
//!       ^                                  |
//!       |                                  +--> smoltcp iface (known TCP flows, RST, ICMP)
//!       |                                              |
//!       +------------- poll task <---- tx queue <------+
//! ```
//!
//! Transport handlers are invoked without any stack lock held. A handler
//! that returns `false` leaves the packet to smoltcp, which answers it the
//! way a host without a listener would.

pub mod checksum;
pub mod device;
pub mod link;
pub mod packet;
pub mod route;
pub mod tcp;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpState};
use smoltcp::time::{Duration as SmoltcpDuration, Instant as SmoltcpInstant};
use smoltcp::wire::{HardwareAddress, IpCidr, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use self::device::{PacketQueue, StackDevice};
use self::link::{LinkEndpoint, NetworkDispatcher};
use self::packet::{NetworkProtocol, PacketBuffer, TransportEndpointId, TransportProtocol, UDP_HEADER_LEN};
use self::route::Route;
use crate::error::StackError;

pub use self::tcp::{TcpEndpoint, TcpForwarder, TcpForwarderRequest};

/// NIC identifier
pub type NicId = u32;

/// Hop limit for packets the stack originates
pub const DEFAULT_TTL: u8 = 64;

/// Default TCP socket buffer size (64 KiB per direction)
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Poll interval when smoltcp has no pending timers
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a released flow may wait for the peer to finish its handshake
const ORPHAN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives transport packets the stack has no endpoint for
pub trait TransportHandler: Send + Sync {
    /// Handle one packet; `true` means the packet was consumed
    fn handle_packet(&self, id: TransportEndpointId, packet: &PacketBuffer) -> bool;
}

/// Protocols enabled on a stack
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocol>,
    pub transport_protocols: Vec<TransportProtocol>,
    /// Receive and send buffer size of each TCP endpoint
    pub tcp_buffer_size: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![TransportProtocol::Tcp, TransportProtocol::Udp],
            tcp_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
        }
    }
}

/// Routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: IpNet,
    pub nic: NicId,
}

/// Protocol address assigned to a NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolAddress {
    pub protocol: NetworkProtocol,
    pub address: IpNet,
}

/// A registered network interface
pub(crate) struct Nic {
    id: NicId,
    link: Arc<dyn LinkEndpoint>,
    addresses: RwLock<Vec<IpNet>>,
    promiscuous: AtomicBool,
    spoofing: AtomicBool,
}

impl Nic {
    fn owns(&self, addr: &IpAddr) -> bool {
        self.addresses.read().iter().any(|net| net.addr() == *addr)
    }

    fn primary_address(&self, protocol: NetworkProtocol) -> Option<IpAddr> {
        self.addresses
            .read()
            .iter()
            .map(IpNet::addr)
            .find(|addr| NetworkProtocol::of(addr) == protocol)
    }
}

/// smoltcp state, created together with the NIC
struct Core {
    nic: NicId,
    iface: Interface,
    sockets: SocketSet<'static>,
    queue: PacketQueue,
    mtu: usize,
    flows: HashMap<TransportEndpointId, SocketHandle>,
    orphans: HashMap<SocketHandle, TransportEndpointId>,
}

impl Core {
    fn poll(&mut self) -> bool {
        let mut device = StackDevice::new(&mut self.queue, self.mtu);
        let changed = self.iface.poll(SmoltcpInstant::now(), &mut device, &mut self.sockets);
        self.retire_reset_flows();
        changed
    }

    /// Abort flow sockets that a reset during the handshake sent back to
    /// Listen, so they can't pick up another source's SYN.
    fn retire_reset_flows(&mut self) {
        for (id, handle) in &self.flows {
            let socket = self.sockets.get_mut::<TcpSocket>(*handle);
            if socket.state() == TcpState::Listen {
                trace!("TCP flow {} was reset during the handshake", id);
                socket.abort();
            }
        }
    }

    fn ingest(&mut self, datagram: Vec<u8>) {
        if self.queue.push_rx(datagram) {
            self.poll();
        }
    }

    fn poll_delay(&mut self) -> Option<Duration> {
        self.iface
            .poll_delay(SmoltcpInstant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    /// Finish the close of orphaned sockets and remove those whose
    /// connection ended. Returns whether any socket started closing.
    fn reap(&mut self) -> bool {
        let mut closing = false;
        let mut finished = Vec::new();
        for handle in self.orphans.keys() {
            let socket = self.sockets.get_mut::<TcpSocket>(*handle);
            match socket.state() {
                TcpState::Closed | TcpState::TimeWait | TcpState::Listen => finished.push(*handle),
                // Close was deferred until the handshake completed
                TcpState::Established | TcpState::CloseWait => {
                    socket.close();
                    closing = true;
                }
                _ => {}
            }
        }

        for handle in finished {
            if let Some(id) = self.orphans.remove(&handle) {
                if self.flows.get(&id) == Some(&handle) {
                    self.flows.remove(&id);
                }
                trace!("reaped TCP endpoint {}", id);
            }
            self.sockets.remove(handle);
        }
        closing
    }
}

pub(crate) struct StackInner {
    options: StackOptions,
    handlers: RwLock<HashMap<TransportProtocol, Arc<dyn TransportHandler>>>,
    routes: RwLock<Vec<RouteEntry>>,
    nics: RwLock<HashMap<NicId, Arc<Nic>>>,
    core: Mutex<Option<Core>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl StackInner {
    fn handler(&self, protocol: TransportProtocol) -> Option<Arc<dyn TransportHandler>> {
        self.handlers.read().get(&protocol).cloned()
    }

    fn to_smoltcp(&self, datagram: Vec<u8>) {
        if let Some(core) = self.core.lock().as_mut() {
            core.ingest(datagram);
        }
        self.wake.notify_one();
    }

    fn deliver(&self, protocol: NetworkProtocol, mut datagram: Vec<u8>) {
        if !self.options.network_protocols.contains(&protocol) {
            trace!("dropping {} packet: protocol disabled", protocol);
            return;
        }

        let parsed = match protocol {
            NetworkProtocol::Ipv4 => Ipv4Packet::new_checked(&datagram[..]).ok().and_then(|ip| {
                if ip.more_frags() || ip.frag_offset() != 0 {
                    return None;
                }
                Some((
                    IpAddr::V4(ip.src_addr().into()),
                    IpAddr::V4(ip.dst_addr().into()),
                    ip.next_header(),
                    usize::from(ip.header_len()),
                    usize::from(ip.total_len()),
                ))
            }),
            NetworkProtocol::Ipv6 => Ipv6Packet::new_checked(&datagram[..]).ok().map(|ip| {
                (
                    IpAddr::V6(ip.src_addr().into()),
                    IpAddr::V6(ip.dst_addr().into()),
                    ip.next_header(),
                    packet::IPV6_HEADER_LEN,
                    packet::IPV6_HEADER_LEN + usize::from(ip.payload_len()),
                )
            }),
        };

        let Some((src, dst, next_header, transport_offset, end)) = parsed else {
            trace!("dropping malformed or fragmented {} packet", protocol);
            return;
        };
        datagram.truncate(end);

        match next_header {
            IpProtocol::Tcp if self.options.transport_protocols.contains(&TransportProtocol::Tcp) => {
                self.deliver_tcp(datagram, src, dst, transport_offset);
            }
            IpProtocol::Udp if self.options.transport_protocols.contains(&TransportProtocol::Udp) => {
                self.deliver_udp(datagram, src, dst, transport_offset);
            }
            _ => self.to_smoltcp(datagram),
        }
    }

    fn deliver_tcp(&self, datagram: Vec<u8>, src: IpAddr, dst: IpAddr, offset: usize) {
        let Ok(segment) = TcpPacket::new_checked(&datagram[offset..]) else {
            trace!("dropping truncated TCP segment from {}", src);
            return;
        };
        let id = TransportEndpointId {
            local_addr: dst,
            local_port: segment.dst_port(),
            remote_addr: src,
            remote_port: segment.src_port(),
        };
        let opens_flow = segment.syn() && !segment.ack();
        let payload = offset + usize::from(segment.header_len());

        {
            let mut guard = self.core.lock();
            let Some(core) = guard.as_mut() else { return };
            if core.flows.contains_key(&id) {
                core.ingest(datagram);
                drop(guard);
                self.wake.notify_one();
                return;
            }
        }

        if opens_flow {
            if let Some(handler) = self.handler(TransportProtocol::Tcp) {
                let packet = PacketBuffer::inbound(datagram, offset, payload);
                if handler.handle_packet(id, &packet) {
                    return;
                }
                self.to_smoltcp(packet.into_vec());
                return;
            }
        }
        self.to_smoltcp(datagram);
    }

    fn deliver_udp(&self, datagram: Vec<u8>, src: IpAddr, dst: IpAddr, offset: usize) {
        if datagram.len() < offset + UDP_HEADER_LEN {
            trace!("dropping truncated UDP datagram from {}", src);
            return;
        }
        let header = &datagram[offset..offset + UDP_HEADER_LEN];
        let id = TransportEndpointId {
            local_addr: dst,
            local_port: u16::from_be_bytes([header[2], header[3]]),
            remote_addr: src,
            remote_port: u16::from_be_bytes([header[0], header[1]]),
        };

        let packet = PacketBuffer::inbound(datagram, offset, offset + UDP_HEADER_LEN);
        match self.handler(TransportProtocol::Udp) {
            Some(handler) if handler.handle_packet(id, &packet) => {}
            _ => self.to_smoltcp(packet.into_vec()),
        }
    }

    pub(crate) fn create_tcp_endpoint(
        self: &Arc<Self>,
        id: TransportEndpointId,
        syn: Vec<u8>,
        max_conns: usize,
    ) -> Result<TcpEndpoint, StackError> {
        let mut guard = self.core.lock();
        let core = guard.as_mut().ok_or(StackError::InvalidEndpointState)?;

        if core.flows.contains_key(&id) {
            return Err(StackError::ConnectionRefused);
        }
        if core.flows.len() >= max_conns {
            return Err(StackError::TooManyConnections {
                current: core.flows.len(),
                max: max_conns,
            });
        }

        let size = self.options.tcp_buffer_size;
        let mut socket = TcpSocket::new(
            smoltcp::socket::tcp::SocketBuffer::new(vec![0u8; size]),
            smoltcp::socket::tcp::SocketBuffer::new(vec![0u8; size]),
        );
        socket.set_nagle_enabled(false);
        socket
            .listen(smoltcp::wire::IpListenEndpoint {
                addr: Some(id.local_addr.into()),
                port: id.local_port,
            })
            .map_err(|_| StackError::BadAddress(id.local_addr))?;

        let handle = core.sockets.add(socket);
        core.flows.insert(id, handle);
        // Bind the SYN to this socket before another listener for the same
        // destination can see it.
        core.ingest(syn);
        drop(guard);
        self.wake.notify_one();

        Ok(TcpEndpoint::new(Arc::clone(self), handle, id))
    }

    pub(crate) fn release_tcp_endpoint(&self, handle: SocketHandle, id: TransportEndpointId) {
        if let Some(core) = self.core.lock().as_mut() {
            let socket = core.sockets.get_mut::<TcpSocket>(handle);
            if socket.state() == TcpState::SynReceived {
                // A FIN queued before the handshake completes is never sent;
                // reap closes the socket once the peer's ACK arrives.
                let timeout = SmoltcpDuration::from_millis(ORPHAN_HANDSHAKE_TIMEOUT.as_millis() as u64);
                socket.set_timeout(Some(timeout));
            } else {
                socket.close();
            }
            core.orphans.insert(handle, id);
        }
        self.wake.notify_one();
    }

    fn sync_routes(&self, core: &mut Core) -> Result<(), StackError> {
        let Some(nic) = self.nics.read().get(&core.nic).cloned() else {
            return Ok(());
        };
        for entry in self.routes.read().iter().filter(|e| e.nic == core.nic) {
            if entry.destination.prefix_len() != 0 {
                continue;
            }
            match entry.destination {
                IpNet::V4(_) => {
                    if let Some(IpAddr::V4(gateway)) = nic.primary_address(NetworkProtocol::Ipv4) {
                        core.iface
                            .routes_mut()
                            .add_default_ipv4_route(gateway.into())
                            .map_err(|_| StackError::NotSupported)?;
                    }
                }
                IpNet::V6(_) => {
                    if let Some(IpAddr::V6(gateway)) = nic.primary_address(NetworkProtocol::Ipv6) {
                        core.iface
                            .routes_mut()
                            .add_default_ipv6_route(gateway.into())
                            .map_err(|_| StackError::NotSupported)?;
                    }
                }
            }
        }
        Ok(())
    }
}

struct StackDispatcher {
    stack: Weak<StackInner>,
}

impl NetworkDispatcher for StackDispatcher {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer) {
        if let Some(stack) = self.stack.upgrade() {
            stack.deliver(protocol, packet.into_vec());
        }
    }
}

/// Handle to a protocol stack instance
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("options", &self.inner.options)
            .field("nics", &self.inner.nics.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Stack {
    #[must_use]
    pub fn new(options: StackOptions) -> Self {
        Self {
            inner: Arc::new(StackInner {
                options,
                handlers: RwLock::new(HashMap::new()),
                routes: RwLock::new(Vec::new()),
                nics: RwLock::new(HashMap::new()),
                core: Mutex::new(None),
                wake: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<StackInner> {
        Arc::downgrade(&self.inner)
    }

    /// Register the handler for packets of `protocol` without an endpoint
    pub fn set_transport_protocol_handler(
        &self,
        protocol: TransportProtocol,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<(), StackError> {
        if !self.inner.options.transport_protocols.contains(&protocol) {
            return Err(StackError::UnknownProtocol(protocol.to_string()));
        }
        self.inner.handlers.write().insert(protocol, handler);
        Ok(())
    }

    /// Append a route; later lookups pick the first matching entry
    pub fn add_route(&self, entry: RouteEntry) {
        self.inner.routes.write().push(entry);
        if let Some(core) = self.inner.core.lock().as_mut() {
            if let Err(e) = self.inner.sync_routes(core) {
                warn!("failed to install route {:?}: {}", entry, e);
            }
        }
    }

    /// Register `link` as NIC `id` and start delivering its packets
    ///
    /// Must be called from within a tokio runtime; the stack's poll task is
    /// spawned here.
    pub fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<(), StackError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StackError::InvalidEndpointState)?;

        if self.inner.nics.read().contains_key(&id) {
            return Err(StackError::DuplicateNicId(id));
        }

        {
            let mut guard = self.inner.core.lock();
            if guard.is_some() {
                // smoltcp state is per interface; one NIC per stack
                return Err(StackError::NotSupported);
            }

            let mtu = link.mtu() as usize;
            let mut queue = PacketQueue::new();
            let mut config = IfaceConfig::new(HardwareAddress::Ip);
            config.random_seed = random_seed();
            let iface = Interface::new(config, &mut StackDevice::new(&mut queue, mtu), SmoltcpInstant::now());

            *guard = Some(Core {
                nic: id,
                iface,
                sockets: SocketSet::new(Vec::new()),
                queue,
                mtu,
                flows: HashMap::new(),
                orphans: HashMap::new(),
            });
        }

        let nic = Arc::new(Nic {
            id,
            link: Arc::clone(&link),
            addresses: RwLock::new(Vec::new()),
            promiscuous: AtomicBool::new(false),
            spoofing: AtomicBool::new(false),
        });
        self.inner.nics.write().insert(id, nic);

        link.attach(Some(Arc::new(StackDispatcher {
            stack: Arc::downgrade(&self.inner),
        })));

        runtime.spawn(run_poller(
            Arc::downgrade(&self.inner),
            link,
            Arc::clone(&self.inner.wake),
            self.inner.shutdown.clone(),
        ));

        debug!("created NIC {}", id);
        Ok(())
    }

    fn nic(&self, id: NicId) -> Result<Arc<Nic>, StackError> {
        self.inner.nics.read().get(&id).cloned().ok_or(StackError::UnknownNic(id))
    }

    /// Assign an address to a NIC
    pub fn add_protocol_address(&self, id: NicId, address: ProtocolAddress) -> Result<(), StackError> {
        let nic = self.nic(id)?;
        if !self.inner.options.network_protocols.contains(&address.protocol) {
            return Err(StackError::UnknownProtocol(address.protocol.to_string()));
        }
        if NetworkProtocol::of(&address.address.addr()) != address.protocol {
            return Err(StackError::BadAddress(address.address.addr()));
        }

        let mut guard = self.inner.core.lock();
        let core = guard.as_mut().ok_or(StackError::UnknownNic(id))?;
        let cidr = IpCidr::new(address.address.addr().into(), address.address.prefix_len());
        let mut full = false;
        core.iface.update_ip_addrs(|addrs| full = addrs.push(cidr).is_err());
        if full {
            return Err(StackError::NotSupported);
        }
        nic.addresses.write().push(address.address);
        self.inner.sync_routes(core)
    }

    /// Accept packets addressed to any destination
    pub fn set_promiscuous_mode(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        let nic = self.nic(id)?;
        nic.promiscuous.store(enable, Ordering::Relaxed);
        if let Some(core) = self.inner.core.lock().as_mut() {
            core.iface.set_any_ip(enable);
        }
        Ok(())
    }

    /// Allow sending from addresses the NIC does not own
    pub fn set_spoofing(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        self.nic(id)?.spoofing.store(enable, Ordering::Relaxed);
        Ok(())
    }

    /// Resolve a route from `local` to `remote` through NIC `id`
    pub fn find_route(
        &self,
        id: NicId,
        local: IpAddr,
        remote: IpAddr,
        protocol: NetworkProtocol,
    ) -> Result<Route, StackError> {
        let nic = self.nic(id)?;
        if !self.inner.options.network_protocols.contains(&protocol) {
            return Err(StackError::UnknownProtocol(protocol.to_string()));
        }
        if NetworkProtocol::of(&local) != protocol || NetworkProtocol::of(&remote) != protocol {
            return Err(StackError::AddressFamilyMismatch { local, remote });
        }
        let routed = self
            .inner
            .routes
            .read()
            .iter()
            .any(|entry| entry.nic == id && entry.destination.contains(&remote));
        if !routed {
            return Err(StackError::NoRoute(remote));
        }
        if !nic.spoofing.load(Ordering::Relaxed) && !nic.owns(&local) {
            return Err(StackError::BadLocalAddress(local));
        }
        Ok(Route::new(local, remote, protocol, nic))
    }

    /// Number of TCP endpoints currently held by the stack
    #[must_use]
    pub fn tcp_endpoint_count(&self) -> usize {
        self.inner.core.lock().as_ref().map_or(0, |core| core.flows.len())
    }

    /// Stop the poll task, detach every NIC and drop all handlers
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        for nic in self.inner.nics.read().values() {
            nic.link.attach(None);
        }
        self.inner.handlers.write().clear();
        self.inner.core.lock().take();
    }
}

fn random_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Drive smoltcp timers and flush its output to the link
async fn run_poller(
    stack: Weak<StackInner>,
    link: Arc<dyn LinkEndpoint>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    loop {
        let (outbound, delay) = {
            let Some(inner) = stack.upgrade() else { break };
            let mut guard = inner.core.lock();
            let Some(core) = guard.as_mut() else { break };
            core.poll();
            if core.reap() {
                core.poll();
            }
            (core.queue.drain_tx(), core.poll_delay())
        };

        flush(&*link, outbound).await;

        let delay = delay.unwrap_or(IDLE_POLL_INTERVAL).min(IDLE_POLL_INTERVAL);
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = wake.notified() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!("stack poll task stopped");
}

/// Write datagrams in order, batching runs of the same network protocol
async fn flush(link: &dyn LinkEndpoint, outbound: Vec<Vec<u8>>) {
    let mut batch: Vec<PacketBuffer> = Vec::new();
    let mut batch_proto = None;

    for datagram in outbound {
        let Some(protocol) = NetworkProtocol::from_datagram(&datagram) else {
            continue;
        };
        if batch_proto.is_some_and(|p| p != protocol) {
            write_batch(link, batch_proto, std::mem::take(&mut batch)).await;
        }
        batch_proto = Some(protocol);
        batch.push(PacketBuffer::from_datagram(datagram));
    }
    write_batch(link, batch_proto, batch).await;
}

async fn write_batch(link: &dyn LinkEndpoint, protocol: Option<NetworkProtocol>, batch: Vec<PacketBuffer>) {
    let Some(protocol) = protocol else { return };
    let total = batch.len();
    if total == 0 {
        return;
    }
    let written = link.write_packets(protocol, batch).await;
    if written < total {
        debug!("link accepted {} of {} packets", written, total);
    }
}
