//! TCP flow acceptance and stream endpoints
//!
//! [`TcpForwarder`] is the stack's TCP transport handler. For every SYN that
//! opens a flow it hands a [`TcpForwarderRequest`] to a user callback, which
//! either creates a [`TcpEndpoint`] (accepting the flow) or rejects it.
//!
//! A `TcpEndpoint` is a byte stream backed by a smoltcp socket. Reads and
//! writes go through the socket buffers; the stack's poll task moves the
//! segments. Dropping the endpoint closes the flow.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpState};
use smoltcp::time::Duration as SmoltcpDuration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::packet::{PacketBuffer, TransportEndpointId};
use super::{Stack, StackInner, TransportHandler};
use crate::error::StackError;

/// Keepalive probes sent before a silent peer is declared dead
pub const KEEPALIVE_PROBES: u32 = 9;

const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(75);

type RequestHandler = dyn Fn(TcpForwarderRequest) + Send + Sync;

/// Transport handler turning flow-opening SYNs into forwarder requests
pub struct TcpForwarder {
    stack: Weak<StackInner>,
    max_conns: usize,
    handler: Box<RequestHandler>,
}

impl TcpForwarder {
    /// Create a forwarder that admits at most `max_conns` live endpoints
    pub fn new<F>(stack: &Stack, max_conns: usize, handler: F) -> Self
    where
        F: Fn(TcpForwarderRequest) + Send + Sync + 'static,
    {
        Self {
            stack: stack.downgrade(),
            max_conns,
            handler: Box::new(handler),
        }
    }
}

impl TransportHandler for TcpForwarder {
    fn handle_packet(&self, id: TransportEndpointId, packet: &PacketBuffer) -> bool {
        let Some(stack) = self.stack.upgrade() else {
            return false;
        };
        (self.handler)(TcpForwarderRequest {
            stack,
            id,
            syn: packet.as_slice().to_vec(),
            max_conns: self.max_conns,
            accepted: false,
        });
        true
    }
}

/// A pending TCP flow awaiting acceptance
pub struct TcpForwarderRequest {
    stack: Arc<StackInner>,
    id: TransportEndpointId,
    syn: Vec<u8>,
    max_conns: usize,
    accepted: bool,
}

impl TcpForwarderRequest {
    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    /// Accept the flow, creating its stream endpoint
    pub fn create_endpoint(&mut self) -> Result<TcpEndpoint, StackError> {
        let endpoint = self.stack.create_tcp_endpoint(self.id, self.syn.clone(), self.max_conns)?;
        self.accepted = true;
        Ok(endpoint)
    }

    /// Finish the request; an unaccepted flow is reset when `send_reset` is set
    pub fn complete(self, send_reset: bool) {
        if send_reset && !self.accepted {
            trace!("resetting TCP flow {}", self.id);
            self.stack.to_smoltcp(self.syn);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    enabled: bool,
    idle: Duration,
    interval: Duration,
}

/// Stream endpoint of an accepted TCP flow
///
/// smoltcp sends keepalive probes at a single fixed period, so `idle` sets
/// that period and `interval` only widens the abort timeout to
/// `idle + interval * KEEPALIVE_PROBES`.
pub struct TcpEndpoint {
    stack: Arc<StackInner>,
    handle: SocketHandle,
    id: TransportEndpointId,
    keepalive: Keepalive,
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEndpoint").field("id", &self.id).finish_non_exhaustive()
    }
}

impl TcpEndpoint {
    pub(super) fn new(stack: Arc<StackInner>, handle: SocketHandle, id: TransportEndpointId) -> Self {
        Self {
            stack,
            handle,
            id,
            keepalive: Keepalive {
                enabled: false,
                idle: DEFAULT_KEEPALIVE_IDLE,
                interval: DEFAULT_KEEPALIVE_INTERVAL,
            },
        }
    }

    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    fn with_socket<R>(&self, f: impl FnOnce(&mut TcpSocket<'static>) -> R) -> Result<R, StackError> {
        let mut guard = self.stack.core.lock();
        let core = guard.as_mut().ok_or(StackError::InvalidEndpointState)?;
        Ok(f(core.sockets.get_mut::<TcpSocket>(self.handle)))
    }

    fn apply_keepalive(&self) -> Result<(), StackError> {
        let keepalive = self.keepalive;
        self.with_socket(|socket| {
            if keepalive.enabled {
                let timeout = keepalive.idle + keepalive.interval * KEEPALIVE_PROBES;
                socket.set_keep_alive(Some(to_smoltcp(keepalive.idle)));
                socket.set_timeout(Some(to_smoltcp(timeout)));
            } else {
                socket.set_keep_alive(None);
                socket.set_timeout(None);
            }
        })
    }

    pub fn set_keepalive(&mut self, enabled: bool) -> Result<(), StackError> {
        self.keepalive.enabled = enabled;
        self.apply_keepalive()
    }

    /// Idle time before the first probe
    pub fn set_keepalive_idle(&mut self, idle: Duration) -> Result<(), StackError> {
        if idle.is_zero() {
            return Err(StackError::NotSupported);
        }
        self.keepalive.idle = idle;
        self.apply_keepalive()
    }

    /// Spacing of follow-up probes
    pub fn set_keepalive_interval(&mut self, interval: Duration) -> Result<(), StackError> {
        if interval.is_zero() {
            return Err(StackError::NotSupported);
        }
        self.keepalive.interval = interval;
        self.apply_keepalive()
    }

    /// Current keep-alive period and abort timeout of the socket
    pub fn keepalive_settings(&self) -> Result<(Option<Duration>, Option<Duration>), StackError> {
        self.with_socket(|socket| {
            (
                socket.keep_alive().map(from_smoltcp),
                socket.timeout().map(from_smoltcp),
            )
        })
    }

    fn wake_stack(&self) {
        self.stack.wake.notify_one();
    }
}

fn to_smoltcp(duration: Duration) -> SmoltcpDuration {
    SmoltcpDuration::from_millis(duration.as_millis() as u64)
}

fn from_smoltcp(duration: SmoltcpDuration) -> Duration {
    Duration::from_millis(duration.total_millis())
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stack is closed")
}

impl AsyncRead for TcpEndpoint {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut guard = this.stack.core.lock();
        let Some(core) = guard.as_mut() else {
            return Poll::Ready(Err(detached()));
        };
        let socket = core.sockets.get_mut::<TcpSocket>(this.handle);

        if socket.can_recv() {
            return match socket.recv_slice(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    drop(guard);
                    // Window update
                    this.wake_stack();
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, format!("{e:?}")))),
            };
        }

        match socket.state() {
            TcpState::SynReceived
            | TcpState::SynSent
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2 => {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
            // Peer sent FIN, or reset the flow back to Listen or Closed
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for TcpEndpoint {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut guard = this.stack.core.lock();
        let Some(core) = guard.as_mut() else {
            return Poll::Ready(Err(detached()));
        };
        let socket = core.sockets.get_mut::<TcpSocket>(this.handle);

        if socket.can_send() {
            return match socket.send_slice(buf) {
                Ok(n) => {
                    drop(guard);
                    this.wake_stack();
                    Poll::Ready(Ok(n))
                }
                Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, format!("{e:?}")))),
            };
        }

        match socket.state() {
            TcpState::SynReceived | TcpState::SynSent | TcpState::Established | TcpState::CloseWait => {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            // An accepted flow only returns to Listen when the peer resets it
            TcpState::Listen => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "TCP flow was reset during the handshake",
            ))),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "TCP flow is closed for writing",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.with_socket(TcpSocket::close).is_err() {
            return Poll::Ready(Err(detached()));
        }
        this.wake_stack();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.stack.release_tcp_endpoint(self.handle, self.id);
    }
}
