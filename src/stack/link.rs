//! Link-layer device contract
//!
//! A [`LinkEndpoint`] is what the stack registers as a NIC. Inbound traffic
//! flows from the endpoint to the stack through the [`NetworkDispatcher`]
//! the stack attaches; outbound traffic is handed to the endpoint one packet
//! (or one batch) at a time.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;

use super::packet::{NetworkProtocol, PacketBuffer};
use crate::error::StackError;

bitflags! {
    /// Offloads a link endpoint provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkCapabilities: u32 {
        /// Link fills in outbound transport checksums
        const TX_CHECKSUM_OFFLOAD = 1 << 0;
    }
}

/// ARP hardware type reported by a link
///
/// Links carry bare IP datagrams, so there is no hardware addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpHardwareType {
    None,
}

/// Receives inbound datagrams from an attached link endpoint
pub trait NetworkDispatcher: Send + Sync {
    /// Deliver one datagram tagged with its network protocol
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer);
}

/// Link-layer device registered with the stack as a NIC
#[async_trait]
pub trait LinkEndpoint: Send + Sync {
    /// Maximum transmission unit in bytes
    fn mtu(&self) -> u32;

    /// Bytes of link header this endpoint prepends
    fn max_header_length(&self) -> u16;

    /// Hardware address of the link (empty for IP-only links)
    fn link_address(&self) -> &[u8];

    fn capabilities(&self) -> LinkCapabilities;

    fn arp_hardware_type(&self) -> ArpHardwareType;

    /// Attach a dispatcher, or detach with `None`
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    fn is_attached(&self) -> bool;

    /// Write one outbound datagram
    async fn write_packet(&self, protocol: NetworkProtocol, packet: PacketBuffer) -> Result<(), StackError>;

    /// Write a batch sequentially, stopping at the first failure
    ///
    /// Returns the number of packets written.
    async fn write_packets(&self, protocol: NetworkProtocol, packets: Vec<PacketBuffer>) -> usize {
        let mut written = 0;
        for packet in packets {
            if self.write_packet(protocol, packet).await.is_err() {
                break;
            }
            written += 1;
        }
        written
    }

    /// Write a pre-framed link packet
    fn write_raw_packet(&self, packet: PacketBuffer) -> Result<(), StackError>;
}
