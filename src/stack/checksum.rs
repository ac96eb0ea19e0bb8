//! Internet checksum (RFC 1071) helpers
//!
//! Partial sums are carried unfolded as `u32` so pseudo-header, header and
//! payload can be combined in any order before the final fold.

use std::net::IpAddr;

use super::packet::TransportProtocol;

/// Add `data` to a running one's-complement sum
#[must_use]
pub fn sum(data: &[u8], initial: u32) -> u32 {
    let mut acc = u64::from(initial);
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc += u64::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u64::from(u16::from_be_bytes([*last, 0]));
    }
    while acc > 0xFFFF_FFFF {
        acc = (acc & 0xFFFF_FFFF) + (acc >> 32);
    }
    acc as u32
}

/// Fold a running sum to 16 bits without complementing it
#[must_use]
pub fn fold(mut acc: u32) -> u16 {
    while acc > 0xFFFF {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc as u16
}

/// Unfolded sum of the transport pseudo-header
///
/// Both addresses must belong to the same family.
#[must_use]
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: TransportProtocol, length: u32) -> u32 {
    let mut acc = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let acc = sum(&s.octets(), 0);
            let acc = sum(&d.octets(), acc);
            sum(&(length as u16).to_be_bytes(), acc)
        }
        (s, d) => {
            let acc = sum(&to_v6_octets(s), 0);
            let acc = sum(&to_v6_octets(d), acc);
            sum(&length.to_be_bytes(), acc)
        }
    };
    acc = sum(&[0, protocol.number()], acc);
    acc
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Final checksum field value for a transport segment
///
/// `segment` must contain the header with a zeroed checksum field. A result
/// of zero is transmitted as `0xFFFF` since zero means "no checksum" for UDP.
#[must_use]
pub fn transport_checksum(pseudo: u32, segment: &[u8]) -> u16 {
    let value = !fold(sum(segment, pseudo));
    if value == 0 {
        0xFFFF
    } else {
        value
    }
}
