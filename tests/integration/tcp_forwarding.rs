//! TCP forwarding through a host network
//!
//! A smoltcp peer on the sandbox side of the transport opens connections to
//! listeners on the host's loopback.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::socket::tcp::{self, State};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixDatagram};

use nsnet::{HostNetwork, Options, TcpOptions};

use super::peer::{wait_for, Peer};

fn host_network(tcp: TcpOptions) -> (HostNetwork, Peer) {
    let (host_end, peer_end) = UnixDatagram::pair().unwrap();
    let options = Options {
        tcp,
        ..Options::default()
    };
    let host = HostNetwork::with_transport(options, Arc::new(host_end)).unwrap();
    (host, Peer::new(peer_end))
}

async fn listener() -> (TcpListener, SocketAddrV4) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[tokio::test]
async fn test_tcp_echo_completes_both_directions() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1000];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.shutdown().await.unwrap();
        // Returns once the sandbox's FIN has been relayed
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        rest.len()
    });

    let (host, mut peer) = host_network(TcpOptions {
        stats: true,
        ..TcpOptions::default()
    });
    let handle = peer.connect(addr, 40000);

    let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
    let mut sent = 0;
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];

    let finished = peer
        .drive_until(Duration::from_secs(10), |sockets| {
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            if socket.can_send() && sent < payload.len() {
                sent += socket.send_slice(&payload[sent..]).unwrap();
            }
            while socket.can_recv() {
                let n = socket.recv_slice(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() == payload.len() && !socket.may_recv() {
                socket.close();
            }
            matches!(socket.state(), State::Closed | State::TimeWait)
        })
        .await;

    assert!(finished, "connection did not close in both directions");
    assert_eq!(received, payload);
    let trailing = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trailing, 0);

    assert!(
        wait_for(Duration::from_secs(2), || {
            host.tcp_stats()
                .is_some_and(|s| s.conns == 1 && s.sent_bytes >= 1000 && s.recv_bytes >= 1000)
        })
        .await
    );
    // Both copy directions finished and the flow's socket was reaped
    assert!(wait_for(Duration::from_secs(5), || host.stack().tcp_endpoint_count() == 0).await);
    host.close().unwrap();
}

#[tokio::test]
async fn test_tcp_large_transfer() {
    const SIZE: usize = 256 * 1024;

    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();
        data
    });

    let (host, mut peer) = host_network(TcpOptions::default());
    let handle = peer.connect(addr, 40001);

    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 253) as u8).collect();
    let mut sent = 0;
    let finished = peer
        .drive_until(Duration::from_secs(20), |sockets| {
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            if socket.can_send() && sent < payload.len() {
                sent += socket.send_slice(&payload[sent..]).unwrap();
            }
            if sent == payload.len() && socket.send_queue() == 0 {
                socket.close();
            }
            !socket.is_open() || socket.state() == State::FinWait2
        })
        .await;
    assert!(finished);

    let data = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.len(), SIZE);
    assert!(data == payload);
    host.close().unwrap();
}

#[tokio::test]
async fn test_tcp_refused_destination_closes_flow() {
    // Bind then drop to get a loopback port with nothing behind it
    let (listener, addr) = listener().await;
    drop(listener);

    let (host, mut peer) = host_network(TcpOptions::default());
    let handle = peer.connect(addr, 40002);

    let mut established = false;
    let closed = peer
        .drive_until(Duration::from_secs(5), |sockets| {
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            established |= socket.may_send();
            !socket.is_open() || (established && !socket.may_recv())
        })
        .await;

    assert!(established, "stack did not accept the flow");
    assert!(closed, "flow stayed open after the dial failed");
    host.close().unwrap();
}

#[tokio::test]
async fn test_tcp_close_aborts_active_flow() {
    let (listener, addr) = listener().await;
    let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = accepted_tx.send(());
        let mut buf = [0u8; 64];
        // Ends with EOF or a reset once the forwarder lets go
        let _ = stream.read(&mut buf).await;
    });

    let (host, mut peer) = host_network(TcpOptions::default());
    let handle = peer.connect(addr, 40003);
    let established = peer
        .drive_until(Duration::from_secs(5), |sockets| {
            sockets.get_mut::<tcp::Socket>(handle).may_send()
        })
        .await;
    assert!(established);
    tokio::time::timeout(Duration::from_secs(5), accepted_rx)
        .await
        .unwrap()
        .unwrap();

    host.close().unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("host connection outlived close")
        .unwrap();
}
