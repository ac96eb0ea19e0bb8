//! Bridge endpoint: the stack's virtual NIC
//!
//! [`BridgeEndpoint`] implements the link-endpoint contract over a
//! [`PacketTransport`]. It has no link header and no addressing; every
//! datagram read from the transport is a raw IP packet handed to the
//! attached dispatcher, and every packet the stack emits is written as one
//! datagram.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::StackError;
use crate::stack::link::{ArpHardwareType, LinkCapabilities, LinkEndpoint, NetworkDispatcher};
use crate::stack::packet::{NetworkProtocol, PacketBuffer};
use crate::transport::PacketTransport;

/// Default link MTU
pub const DEFAULT_MTU: u32 = 1500;

#[derive(Default)]
struct AttachState {
    dispatcher: Option<Arc<dyn NetworkDispatcher>>,
    dispatch_loop: Option<JoinHandle<()>>,
    generation: u64,
}

/// Virtual NIC bridging a packet transport to the stack
pub struct BridgeEndpoint<T: PacketTransport> {
    transport: Arc<T>,
    mtu: u32,
    state: Arc<Mutex<AttachState>>,
}

impl<T: PacketTransport> std::fmt::Debug for BridgeEndpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeEndpoint")
            .field("mtu", &self.mtu)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<T: PacketTransport> BridgeEndpoint<T> {
    #[must_use]
    pub fn new(transport: Arc<T>, mtu: u32) -> Self {
        Self {
            transport,
            mtu,
            state: Arc::new(Mutex::new(AttachState::default())),
        }
    }

    /// Shut the transport down; the dispatch loop ends on its next read
    pub fn close(&self) -> std::io::Result<()> {
        self.transport.shutdown()
    }
}

impl<T: PacketTransport> Drop for BridgeEndpoint<T> {
    fn drop(&mut self) {
        if let Some(dispatch_loop) = self.state.lock().dispatch_loop.take() {
            dispatch_loop.abort();
        }
    }
}

#[async_trait]
impl<T: PacketTransport> LinkEndpoint for BridgeEndpoint<T> {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn max_header_length(&self) -> u16 {
        0
    }

    fn link_address(&self) -> &[u8] {
        &[]
    }

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities::empty()
    }

    fn arp_hardware_type(&self) -> ArpHardwareType {
        ArpHardwareType::None
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        let mut state = self.state.lock();
        if let Some(previous) = state.dispatch_loop.take() {
            previous.abort();
        }
        state.generation += 1;
        state.dispatcher = dispatcher.clone();

        let Some(dispatcher) = dispatcher else {
            debug!("bridge endpoint detached");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("cannot attach bridge endpoint outside a tokio runtime");
            state.dispatcher = None;
            return;
        };
        state.dispatch_loop = Some(runtime.spawn(dispatch_loop(
            Arc::clone(&self.transport),
            dispatcher,
            self.mtu as usize,
            Arc::clone(&self.state),
            state.generation,
        )));
    }

    fn is_attached(&self) -> bool {
        self.state.lock().dispatcher.is_some()
    }

    async fn write_packet(&self, _protocol: NetworkProtocol, packet: PacketBuffer) -> Result<(), StackError> {
        match self.transport.send_packet(packet.as_slice()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("bridge write failed: {}", e);
                Err(StackError::InvalidEndpointState)
            }
        }
    }

    fn write_raw_packet(&self, _packet: PacketBuffer) -> Result<(), StackError> {
        Err(StackError::NotSupported)
    }
}

/// Read datagrams from the transport and deliver them until it fails
async fn dispatch_loop<T: PacketTransport>(
    transport: Arc<T>,
    dispatcher: Arc<dyn NetworkDispatcher>,
    mtu: usize,
    state: Arc<Mutex<AttachState>>,
    generation: u64,
) {
    // One spare byte tells an exactly-MTU datagram from an oversized one.
    let mut buf = vec![0u8; mtu + 1];

    loop {
        let n = match transport.recv_packet(&mut buf).await {
            Ok(0) => {
                debug!("bridge transport closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("bridge transport read failed: {}", e);
                break;
            }
        };

        if n > mtu {
            debug!("dropping datagram larger than MTU {}", mtu);
            continue;
        }

        let datagram = &buf[..n];
        match NetworkProtocol::from_datagram(datagram) {
            Some(protocol) => {
                dispatcher.deliver_network_packet(protocol, PacketBuffer::from_datagram(datagram.to_vec()));
            }
            None => trace!("dropping datagram with unknown IP version"),
        }
    }

    let mut state = state.lock();
    if state.generation == generation {
        state.dispatcher = None;
        state.dispatch_loop = None;
    }
}
