//! UDP forwarding through a host network
//!
//! The sandbox side writes raw IP datagrams into the transport and reads
//! the relayed replies back out of it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UdpSocket, UnixDatagram};

use nsnet::stack::checksum::{fold, pseudo_header, sum};
use nsnet::stack::packet::TransportProtocol;
use nsnet::{HostNetwork, Options, UdpOptions};

use super::peer::{parse_udp, parse_udp6, udp6_datagram, udp_datagram, wait_for, UdpReply, PEER_ADDR};

async fn echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let std::net::SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

fn host_network(udp: UdpOptions) -> (HostNetwork, UnixDatagram) {
    let (host_end, peer_end) = UnixDatagram::pair().unwrap();
    let options = Options {
        udp,
        ..Options::default()
    };
    let host = HostNetwork::with_transport(options, Arc::new(host_end)).unwrap();
    (host, peer_end)
}

async fn next_udp(peer: &UnixDatagram) -> UdpReply {
    let mut buf = [0u8; 2048];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), peer.recv(&mut buf))
            .await
            .expect("no reply within 3s")
            .unwrap();
        if let Some(reply) = parse_udp(&buf[..n]) {
            return reply;
        }
    }
}

#[tokio::test]
async fn test_udp_echo_round_trip() {
    let server = echo_server().await;
    let (host, peer) = host_network(UdpOptions {
        stats: true,
        ..UdpOptions::default()
    });
    let client = SocketAddrV4::new(PEER_ADDR.into(), 5000);

    peer.send(&udp_datagram(client, server, b"ping")).await.unwrap();

    let reply = next_udp(&peer).await;
    assert_eq!(reply.src, server);
    assert_eq!(reply.dst, client);
    assert_eq!(reply.payload, b"ping");
    // IPv4 replies leave the checksum to the receiver
    assert_eq!(reply.checksum, 0);

    assert!(
        wait_for(Duration::from_secs(2), || {
            host.udp_stats()
                .is_some_and(|s| s.sent_packets == 1 && s.recv_packets == 1)
        })
        .await
    );
    host.close().unwrap();
}

#[tokio::test]
async fn test_udp6_echo_round_trip() {
    let socket = UdpSocket::bind("[::1]:0").await.unwrap();
    let SocketAddr::V6(server) = socket.local_addr().unwrap() else {
        unreachable!("bound to an IPv6 address");
    };
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    let (host, peer) = host_network(UdpOptions::default());
    let client = SocketAddrV6::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2), 5003, 0, 0);

    peer.send(&udp6_datagram(client, server, b"ping6")).await.unwrap();

    let mut buf = [0u8; 2048];
    let reply = loop {
        let n = tokio::time::timeout(Duration::from_secs(3), peer.recv(&mut buf))
            .await
            .expect("no reply within 3s")
            .unwrap();
        if let Some(reply) = parse_udp6(&buf[..n]) {
            break reply;
        }
    };
    assert_eq!(reply.src.ip(), server.ip());
    assert_eq!(reply.src.port(), server.port());
    assert_eq!(reply.dst.ip(), client.ip());
    assert_eq!(reply.dst.port(), client.port());
    assert_eq!(reply.payload, b"ping6");

    // IPv6 requires a checksum; a valid one sums to all ones
    assert_ne!(reply.checksum, 0);
    let pseudo = pseudo_header(
        IpAddr::V6(*reply.src.ip()),
        IpAddr::V6(*reply.dst.ip()),
        TransportProtocol::Udp,
        reply.segment.len() as u32,
    );
    assert_eq!(fold(sum(&reply.segment, pseudo)), 0xFFFF);
    host.close().unwrap();
}

#[tokio::test]
async fn test_udp_flow_reuses_host_socket() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let std::net::SocketAddr::V4(server_addr) = server.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    let (host, peer) = host_network(UdpOptions::default());
    let client = SocketAddrV4::new(PEER_ADDR.into(), 5001);

    let mut buf = [0u8; 64];
    let mut sources = Vec::new();
    for payload in [&b"one"[..], b"two", b"three"] {
        peer.send(&udp_datagram(client, server_addr, payload)).await.unwrap();
        let (n, from) = tokio::time::timeout(Duration::from_secs(3), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], payload);
        sources.push(from);
    }

    // One connected host socket serves the whole flow
    assert!(sources.windows(2).all(|w| w[0] == w[1]));
    host.close().unwrap();
}

#[tokio::test]
async fn test_udp_distinct_flows_get_distinct_sockets() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let std::net::SocketAddr::V4(server_addr) = server.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    let (host, peer) = host_network(UdpOptions::default());

    let mut buf = [0u8; 64];
    let mut sources = Vec::new();
    for port in [6000, 6001] {
        let client = SocketAddrV4::new(PEER_ADDR.into(), port);
        peer.send(&udp_datagram(client, server_addr, b"hi")).await.unwrap();
        let (_, from) = tokio::time::timeout(Duration::from_secs(3), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        sources.push(from);
    }

    assert_ne!(sources[0], sources[1]);
    host.close().unwrap();
}

#[tokio::test]
async fn test_udp_unreachable_destination_is_silent() {
    let (host, peer) = host_network(UdpOptions {
        stats: true,
        ..UdpOptions::default()
    });
    let client = SocketAddrV4::new(PEER_ADDR.into(), 5002);
    // Nothing listens on port 9 of loopback
    let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);

    peer.send(&udp_datagram(client, dst, b"void")).await.unwrap();

    let mut buf = [0u8; 2048];
    let reply = tokio::time::timeout(Duration::from_millis(300), peer.recv(&mut buf)).await;
    assert!(reply.is_err());
    assert_eq!(host.udp_stats().unwrap().recv_packets, 0);
    host.close().unwrap();
}
