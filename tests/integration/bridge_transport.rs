//! Host network over its own packet-mode socket pair
//!
//! The peer end is the fd a child would find at fd 3; here the test holds it
//! directly.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::net::{UdpSocket, UnixDatagram};

use nsnet::config::NetworkOptions;
use nsnet::{HostNetwork, Options};

use super::peer::{parse_udp, udp_datagram, PEER_ADDR};

/// Take the peer fd out of `host` as an async datagram socket
fn peer_socket(host: &mut HostNetwork) -> UnixDatagram {
    let fd = host.release_peer_fd().expect("peer fd already released");
    let socket = std::os::unix::net::UnixDatagram::from(fd);
    socket.set_nonblocking(true).unwrap();
    UnixDatagram::from_std(socket).unwrap()
}

#[tokio::test]
async fn test_seqpacket_udp_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let mut host = HostNetwork::new(Options::default()).unwrap();
    let peer = peer_socket(&mut host);

    let client = SocketAddrV4::new(PEER_ADDR.into(), 7000);
    let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_port);
    peer.send(&udp_datagram(client, dst, b"hello")).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(3), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");
    server.send_to(b"world", from).await.unwrap();

    let n = tokio::time::timeout(Duration::from_secs(3), peer.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = parse_udp(&buf[..n]).unwrap();
    assert_eq!(reply.src, dst);
    assert_eq!(reply.dst, client);
    assert_eq!(reply.payload, b"world");

    host.close().unwrap();
}

#[tokio::test]
async fn test_mtu_sized_datagram_passes_larger_is_dropped() {
    const MTU: u32 = 1400;
    const IP_UDP_HEADERS: usize = 28;

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let options = Options {
        network: NetworkOptions {
            mtu: MTU,
            ..NetworkOptions::default()
        },
        ..Options::default()
    };
    let mut host = HostNetwork::new(options).unwrap();
    let peer = peer_socket(&mut host);
    let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server_port);
    let mut buf = vec![0u8; 4096];

    // One byte over the MTU never reaches the host socket
    let oversized = vec![0xAB; MTU as usize - IP_UDP_HEADERS + 1];
    let client = SocketAddrV4::new(PEER_ADDR.into(), 7001);
    peer.send(&udp_datagram(client, dst, &oversized)).await.unwrap();
    let dropped = tokio::time::timeout(Duration::from_millis(300), server.recv_from(&mut buf)).await;
    assert!(dropped.is_err());

    let exact = vec![0xCD; MTU as usize - IP_UDP_HEADERS];
    let datagram = udp_datagram(client, dst, &exact);
    assert_eq!(datagram.len(), MTU as usize);
    peer.send(&datagram).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &exact[..]);

    host.close().unwrap();
}

#[tokio::test]
async fn test_close_ends_peer_transport() {
    let mut host = HostNetwork::new(Options::default()).unwrap();
    let peer = peer_socket(&mut host);

    host.close().unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), peer.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_child_inherits_transport() {
    let mut host = HostNetwork::new(Options::default()).unwrap();
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg("[ -S /proc/self/fd/3 ]");
    host.attach_to_command(&mut command).unwrap();

    let status = command.status().await.unwrap();
    host.release_peer_fd();
    assert!(status.success());
    host.close().unwrap();
}
