//! Forwarder statistics
//!
//! Counters are plain atomics updated with relaxed ordering; each counter is
//! independently consistent and snapshots are taken field by field.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// TCP forwarder counters
#[derive(Debug, Default)]
pub struct TcpStats {
    /// Flows accepted
    conns: AtomicU32,
    /// Bytes read from the sandbox side
    sent_bytes: AtomicU64,
    /// Bytes written back to the sandbox side
    recv_bytes: AtomicU64,
}

impl TcpStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TcpStatsSnapshot {
        TcpStatsSnapshot {
            conns: self.conns.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TcpStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpStatsSnapshot {
    pub conns: u32,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

impl TcpStatsSnapshot {
    /// Bytes moved in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.sent_bytes + self.recv_bytes
    }
}

/// UDP forwarder counters
#[derive(Debug, Default)]
pub struct UdpStats {
    sent_bytes: AtomicU64,
    sent_packets: AtomicU32,
    recv_bytes: AtomicU64,
    recv_packets: AtomicU32,
    /// Datagrams dropped because the work queue was full
    dropped_packets: AtomicU32,
}

impl UdpStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a datagram from the sandbox, at enqueue time
    pub fn record_sent(&self, bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a datagram written back to the sandbox
    pub fn record_recv(&self, bytes: usize) {
        self.recv_packets.fetch_add(1, Ordering::Relaxed);
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> UdpStatsSnapshot {
        UdpStatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            recv_packets: self.recv_packets.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`UdpStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpStatsSnapshot {
    pub sent_bytes: u64,
    pub sent_packets: u32,
    pub recv_bytes: u64,
    pub recv_packets: u32,
    pub dropped_packets: u32,
}

/// Stream decorator adding every read and write to [`TcpStats`]
///
/// Reads count as received bytes and writes as sent bytes, so the wrapped
/// stream must be the sandbox-facing side of a flow: data the sandbox sends
/// is received, data written back to it is sent.
#[derive(Debug)]
pub struct StatsStream<S> {
    inner: S,
    stats: Arc<TcpStats>,
}

impl<S> StatsStream<S> {
    pub fn new(inner: S, stats: Arc<TcpStats>) -> Self {
        Self { inner, stats }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StatsStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.stats.record_recv(n);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StatsStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.stats.record_sent(n);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
