//! Packet-mode transport to the sandboxed peer
//!
//! The host and the peer exchange whole IP datagrams over an
//! `AF_UNIX`/`SOCK_SEQPACKET` socket pair: one send is one datagram, record
//! boundaries are preserved and a read never merges two datagrams.
//!
//! [`PacketTransport`] abstracts the host end so the bridge endpoint can run
//! over any datagram-preserving channel.

use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::UnixDatagram;

/// Datagram-preserving, full-duplex channel to the peer
#[async_trait]
pub trait PacketTransport: Send + Sync + 'static {
    /// Receive one datagram into `buf`, returning its length
    ///
    /// A datagram longer than `buf` is truncated. `Ok(0)` means the peer
    /// closed the channel.
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send `buf` as one datagram
    async fn send_packet(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shut the channel down in both directions
    fn shutdown(&self) -> io::Result<()>;
}

/// Host end of a `SOCK_SEQPACKET` socket pair
#[derive(Debug)]
pub struct SeqPacket {
    inner: AsyncFd<Socket>,
}

impl SeqPacket {
    /// Create a connected pair, returning the host end and the peer's fd
    ///
    /// Both ends are close-on-exec; the peer fd must be explicitly passed to
    /// a child process.
    ///
    /// # Errors
    ///
    /// Fails if the socket pair cannot be created or registered with the
    /// tokio reactor (requires a running runtime).
    pub fn pair() -> io::Result<(Self, OwnedFd)> {
        let (host, peer) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None)?;
        host.set_nonblocking(true)?;
        Ok((Self::from_socket(host)?, peer.into()))
    }

    /// Wrap an existing non-blocking packet-mode socket
    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        // SAFETY: `socket` owns its descriptor and moves into the `AsyncFd`,
        // so the fd stays open and unchanged until the `AsyncFd` is dropped.
        let inner = unsafe { AsyncFd::register_with_interest(socket, Interest::READABLE | Interest::WRITABLE) }
            .map_err(io::Error::from)?;
        Ok(Self { inner })
    }
}

impl AsRawFd for SeqPacket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[async_trait]
impl PacketTransport for SeqPacket {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_packet(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.inner.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl PacketTransport for UnixDatagram {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let ready = self.ready(Interest::READABLE).await?;
            match self.try_recv(buf) {
                Ok(n) => return Ok(n),
                // Datagram sockets keep failing with EAGAIN after shutdown
                // instead of reporting EOF.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if ready.is_read_closed() {
                        return Ok(0);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_packet(&self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf).await
    }

    fn shutdown(&self) -> io::Result<()> {
        match UnixDatagram::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_socket(fd: OwnedFd) -> SeqPacket {
        let socket = Socket::from(fd);
        socket.set_nonblocking(true).unwrap();
        SeqPacket::from_socket(socket).unwrap()
    }

    #[tokio::test]
    async fn test_seqpacket_preserves_boundaries() {
        let (host, peer_fd) = SeqPacket::pair().unwrap();
        let peer = peer_socket(peer_fd);

        peer.send_packet(b"first").await.unwrap();
        peer.send_packet(b"second datagram").await.unwrap();

        let mut buf = [0u8; 64];
        let n = host.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = host.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second datagram");
    }

    #[tokio::test]
    async fn test_seqpacket_truncates_long_datagram() {
        let (host, peer_fd) = SeqPacket::pair().unwrap();
        let peer = peer_socket(peer_fd);

        peer.send_packet(&[7u8; 32]).await.unwrap();
        peer.send_packet(b"next").await.unwrap();

        let mut small = [0u8; 8];
        assert_eq!(host.recv_packet(&mut small).await.unwrap(), 8);
        let mut buf = [0u8; 64];
        let n = host.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn test_seqpacket_eof_after_peer_close() {
        let (host, peer_fd) = SeqPacket::pair().unwrap();
        drop(peer_fd);
        let mut buf = [0u8; 16];
        assert_eq!(host.recv_packet(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unix_datagram_eof_after_shutdown() {
        let (host, peer) = UnixDatagram::pair().unwrap();
        peer.send(b"queued").await.unwrap();
        PacketTransport::shutdown(&host).unwrap();

        let mut buf = [0u8; 16];
        let first = tokio::time::timeout(std::time::Duration::from_secs(2), host.recv_packet(&mut buf))
            .await
            .expect("recv stalled after shutdown")
            .unwrap();
        // A datagram queued before shutdown may still be read once
        if first != 0 {
            assert_eq!(&buf[..first], b"queued");
            let next = tokio::time::timeout(std::time::Duration::from_secs(2), host.recv_packet(&mut buf))
                .await
                .expect("recv stalled after shutdown")
                .unwrap();
            assert_eq!(next, 0);
        }
    }

    #[tokio::test]
    async fn test_shutdown_wakes_reader() {
        let (host, _peer_fd) = SeqPacket::pair().unwrap();
        host.shutdown().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(host.recv_packet(&mut buf).await.unwrap(), 0);
    }
}
