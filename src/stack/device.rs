//! smoltcp device adapter
//!
//! The smoltcp interface never touches the link endpoint directly. Inbound
//! datagrams are queued by the stack's dispatcher and consumed on the next
//! poll; datagrams produced by smoltcp are queued and drained by the poll
//! task, which writes them to the NIC's link endpoint.
//!
//! ```text
//! +----------------+     +----------------+     +-----------------+
//! | smoltcp iface  | <-> |  StackDevice   | <-> |  LinkEndpoint   |
//! | (TCP state)    |     | (packet queue) |     |  (bridge)       |
//! +----------------+     +----------------+     +-----------------+
//! ```

use std::collections::VecDeque;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::trace;

/// Maximum packets buffered in either direction
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// FIFO queues between the dispatcher, smoltcp and the poll task
#[derive(Debug, Default)]
pub struct PacketQueue {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram for smoltcp, `false` if the queue is full
    pub fn push_rx(&mut self, packet: Vec<u8>) -> bool {
        if self.rx.len() >= MAX_QUEUE_DEPTH {
            trace!("RX queue full, dropping packet ({} bytes)", packet.len());
            return false;
        }
        self.rx.push_back(packet);
        true
    }

    pub fn pop_rx(&mut self) -> Option<Vec<u8>> {
        self.rx.pop_front()
    }

    /// Queue a datagram produced by smoltcp, `false` if the queue is full
    pub fn push_tx(&mut self, packet: Vec<u8>) -> bool {
        if self.tx.len() >= MAX_QUEUE_DEPTH {
            trace!("TX queue full, dropping packet ({} bytes)", packet.len());
            return false;
        }
        self.tx.push_back(packet);
        true
    }

    /// Take every datagram waiting for the link
    pub fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        self.tx.drain(..).collect()
    }

    #[must_use]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }
}

/// smoltcp `Device` backed by a [`PacketQueue`]
///
/// Borrowed for the duration of a single `Interface::poll` call.
pub struct StackDevice<'q> {
    queue: &'q mut PacketQueue,
    mtu: usize,
}

impl<'q> StackDevice<'q> {
    pub fn new(queue: &'q mut PacketQueue, mtu: usize) -> Self {
        Self { queue, mtu }
    }
}

impl Device for StackDevice<'_> {
    type RxToken<'a> = StackRxToken where Self: 'a;
    type TxToken<'a> = StackTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: SmoltcpInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.queue.pop_rx()?;
        Some((
            StackRxToken { packet },
            StackTxToken {
                queue: &mut *self.queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(StackTxToken {
            queue: &mut *self.queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        // The link offers no offloads: compute on transmit, trust the peer's
        // kernel on receive.
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Tx;
        caps.checksum.tcp = Checksum::Tx;
        caps.checksum.udp = Checksum::Tx;
        caps.checksum.icmpv4 = Checksum::Tx;
        caps.checksum.icmpv6 = Checksum::Tx;
        caps
    }
}

pub struct StackRxToken {
    packet: Vec<u8>,
}

impl RxToken for StackRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.packet;
        f(&mut packet)
    }
}

pub struct StackTxToken<'a> {
    queue: &'a mut PacketQueue,
}

impl TxToken for StackTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push_tx(buffer);
        result
    }
}
