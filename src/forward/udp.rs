//! UDP forwarder
//!
//! Datagrams from the sandbox are validated on the stack's dispatch path and
//! queued without blocking. A fixed pool of workers drains the queue; each
//! packet is written through the flow's host socket, created on first use.
//!
//! ```text
//!  stack --handle_packet--> [bounded queue] --> worker 0..N --send--> host socket
//!                                                                       |
//!  stack <--route.write_packet-- return path (one per flow) <--recv-----+
//! ```
//!
//! Every host socket in the pool has exactly one return-path task. That task
//! owns the pool entry: when it ends, for whatever reason, it evicts the entry
//! if the entry still holds its socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::UdpOptions;
use crate::error::StackError;
use crate::stack::checksum;
use crate::stack::packet::{NetworkProtocol, PacketBuffer, TransportEndpointId, TransportProtocol, UDP_HEADER_LEN};
use crate::stack::route::{NetworkHeaderParams, Route};
use crate::stack::{NicId, Stack, TransportHandler};
use crate::stats::{UdpStats, UdpStatsSnapshot};

/// Largest datagram a host socket can return
const MAX_DATAGRAM_SIZE: usize = 65535;

/// A datagram from the sandbox waiting for a worker
#[derive(Debug)]
pub(crate) struct UdpPacket {
    id: TransportEndpointId,
    payload: Bytes,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<UdpPacket>>>;

/// Forwards UDP flows from the stack to host sockets
pub struct UdpForwarder {
    inner: Arc<UdpInner>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for UdpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpForwarder")
            .field("options", &self.inner.options)
            .field("flows", &self.inner.pool.len())
            .finish_non_exhaustive()
    }
}

pub(crate) struct UdpInner {
    stack: Stack,
    nic: NicId,
    options: UdpOptions,
    /// `None` once the forwarder is closed
    queue: RwLock<Option<mpsc::Sender<UdpPacket>>>,
    pool: DashMap<TransportEndpointId, Arc<UdpSocket>>,
    stats: Option<Arc<UdpStats>>,
    shutdown: CancellationToken,
}

impl UdpForwarder {
    /// Create the forwarder, start its workers and register it with `stack`
    ///
    /// # Errors
    ///
    /// Returns `StackError::InvalidEndpointState` outside a tokio runtime and
    /// `StackError::UnknownProtocol` if the stack has UDP disabled.
    pub fn new(stack: &Stack, nic: NicId, options: UdpOptions) -> Result<Self, StackError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StackError::InvalidEndpointState)?;
        let threads = options.threads.max(1);
        let (inner, rx) = UdpInner::build(stack, nic, options);

        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..threads)
            .map(|worker_id| runtime.spawn(worker_loop(worker_id, Arc::clone(&inner), Arc::clone(&rx))))
            .collect();

        stack.set_transport_protocol_handler(TransportProtocol::Udp, Arc::clone(&inner) as Arc<dyn TransportHandler>)?;
        debug!("UDP forwarder started with {} workers", threads);

        Ok(Self { inner, workers })
    }

    /// Close the work queue and cancel every flow
    ///
    /// Workers exit once the queue is drained; packets still queued are
    /// discarded.
    pub fn close(&self) {
        self.inner.close();
        debug!("UDP forwarder closed");
    }

    /// Snapshot of the counters, `None` when statistics are disabled
    #[must_use]
    pub fn stats(&self) -> Option<UdpStatsSnapshot> {
        self.inner.stats.as_ref().map(|stats| stats.snapshot())
    }

    /// Number of flows with a live host socket
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.inner.pool.len()
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        self.inner.close();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl UdpInner {
    /// Create the shared state and the queue's receiving end
    pub(crate) fn build(stack: &Stack, nic: NicId, options: UdpOptions) -> (Arc<Self>, mpsc::Receiver<UdpPacket>) {
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let stats = options.stats.then(|| Arc::new(UdpStats::new()));
        let inner = Arc::new(Self {
            stack: stack.clone(),
            nic,
            options,
            queue: RwLock::new(Some(tx)),
            pool: DashMap::new(),
            stats,
            shutdown: CancellationToken::new(),
        });
        (inner, rx)
    }

    fn close(&self) {
        self.queue.write().take();
        self.shutdown.cancel();
    }

    async fn forward(self: &Arc<Self>, packet: UdpPacket) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let socket = match self.get_or_create_conn(packet.id).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("UDP flow {}: cannot open host socket: {}", packet.id, e);
                return;
            }
        };
        match socket.send(&packet.payload).await {
            Ok(n) => trace!("UDP flow {}: forwarded {} bytes", packet.id, n),
            Err(e) => warn!("UDP flow {}: host write failed: {}", packet.id, e),
        }
    }

    /// Look up the flow's host socket, creating it on first use
    ///
    /// Concurrent first packets of one flow may each open a socket; only the
    /// first stored wins and the others are closed.
    pub(crate) async fn get_or_create_conn(self: &Arc<Self>, id: TransportEndpointId) -> io::Result<Arc<UdpSocket>> {
        if let Some(socket) = self.pool.get(&id) {
            return Ok(Arc::clone(socket.value()));
        }

        let bind_addr = match id.net_proto() {
            NetworkProtocol::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            NetworkProtocol::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(id.local()).await?;
        let socket = Arc::new(socket);

        match self.pool.entry(id) {
            Entry::Occupied(existing) => {
                trace!("UDP flow {}: lost creation race, closing duplicate socket", id);
                Ok(Arc::clone(existing.get()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&socket));
                debug!("UDP flow {}: opened host socket", id);
                tokio::spawn(return_path(
                    Arc::clone(self),
                    id,
                    Arc::clone(&socket),
                    self.shutdown.child_token(),
                ));
                Ok(socket)
            }
        }
    }
}

impl TransportHandler for UdpInner {
    fn handle_packet(&self, id: TransportEndpointId, packet: &PacketBuffer) -> bool {
        let header = packet.transport_header();
        let available = packet.payload();
        if header.len() < UDP_HEADER_LEN {
            return true;
        }

        let declared = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if declared < UDP_HEADER_LEN || declared > UDP_HEADER_LEN + available.len() {
            trace!("UDP flow {}: dropping datagram with length field {}", id, declared);
            return true;
        }
        let payload = Bytes::copy_from_slice(&available[..declared - UDP_HEADER_LEN]);

        if let Some(stats) = &self.stats {
            stats.record_sent(payload.len());
        }

        let queue = self.queue.read();
        let Some(tx) = queue.as_ref() else {
            return true;
        };
        match tx.try_send(UdpPacket { id, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("UDP queue full, dropping datagram for {}", id);
                if let Some(stats) = &self.stats {
                    stats.record_dropped();
                }
            }
            Err(TrySendError::Closed(_)) => trace!("UDP queue closed, dropping datagram for {}", id),
        }
        true
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<UdpInner>, rx: SharedReceiver) {
    trace!("UDP worker {} started", worker_id);
    loop {
        let packet = rx.lock().await.recv().await;
        let Some(packet) = packet else {
            break;
        };
        inner.forward(packet).await;
    }
    trace!("UDP worker {} exited", worker_id);
}

/// Evicts the flow from the pool when its return path ends
struct FlowGuard {
    inner: Arc<UdpInner>,
    id: TransportEndpointId,
    socket: Arc<UdpSocket>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let socket = &self.socket;
        self.inner.pool.remove_if(&self.id, |_, stored| Arc::ptr_eq(stored, socket));
        debug!("UDP flow {}: closed", self.id);
    }
}

/// Relay host replies for one flow back into the stack
async fn return_path(inner: Arc<UdpInner>, id: TransportEndpointId, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let guard = FlowGuard {
        inner,
        id,
        socket,
    };
    let inner = &guard.inner;
    let timeout = inner.options.timeout();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let n = tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            result = tokio::time::timeout(timeout, guard.socket.recv(&mut buf)) => match result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("UDP flow {}: host read failed: {}", id, e);
                    break;
                }
                Err(_) => {
                    debug!("UDP flow {}: idle for {:?}", id, timeout);
                    break;
                }
            },
        };

        let route = match inner.stack.find_route(inner.nic, id.local_addr, id.remote_addr, id.net_proto()) {
            Ok(route) => route,
            Err(e) => {
                debug!("UDP flow {}: no route back: {}", id, e);
                break;
            }
        };

        if UDP_HEADER_LEN + n > route.mtu() {
            debug!("UDP flow {}: dropping {} byte reply larger than the MTU", id, n);
            continue;
        }

        let packet = build_reply(&route, id, &buf[..n]);
        let params = NetworkHeaderParams {
            protocol: TransportProtocol::Udp,
            ttl: route.default_ttl(),
            tos: 0,
        };
        if let Err(e) = route.write_packet(params, packet).await {
            debug!("UDP flow {}: write to stack failed: {}", id, e);
            break;
        }

        if let Some(stats) = &inner.stats {
            stats.record_recv(n);
        }
    }
}

/// Frame `payload` as a UDP datagram from the flow's local end to its remote end
///
/// The checksum is only computed for IPv6 on links without transmit offload;
/// IPv4 replies carry a zero checksum.
pub(crate) fn build_reply(route: &Route, id: TransportEndpointId, payload: &[u8]) -> PacketBuffer {
    let length = (UDP_HEADER_LEN + payload.len()) as u16;

    let mut header = [0u8; UDP_HEADER_LEN];
    header[0..2].copy_from_slice(&id.local_port.to_be_bytes());
    header[2..4].copy_from_slice(&id.remote_port.to_be_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());

    if route.requires_tx_transport_checksum() && route.net_proto() == NetworkProtocol::Ipv6 {
        let pseudo = route.pseudo_header_checksum(TransportProtocol::Udp, length);
        let value = checksum::transport_checksum(checksum::sum(&header, pseudo), payload);
        header[6..8].copy_from_slice(&value.to_be_bytes());
    }

    let mut packet = PacketBuffer::with_headroom(UDP_HEADER_LEN + route.max_header_length(), payload);
    packet.push_transport_header(UDP_HEADER_LEN).copy_from_slice(&header);
    packet
}
