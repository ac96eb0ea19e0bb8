//! TCP forwarder
//!
//! Each flow the sandbox opens is accepted as a stack endpoint, a host TCP
//! connection to the flow's original destination is dialed, and the two are
//! spliced together until both directions finish.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TcpOptions;
use crate::error::StackError;
use crate::io::bidirectional_copy;
use crate::stack::packet::{TransportEndpointId, TransportProtocol};
use crate::stack::{self, Stack, TcpEndpoint, TcpForwarderRequest};
use crate::stats::{StatsStream, TcpStats, TcpStatsSnapshot};

/// Forwards TCP flows from the stack to host connections
pub struct TcpForwarder {
    inner: Arc<TcpInner>,
}

impl std::fmt::Debug for TcpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpForwarder")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

struct TcpInner {
    options: TcpOptions,
    stats: Option<Arc<TcpStats>>,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl TcpForwarder {
    /// Create the forwarder and register it as the stack's TCP handler
    ///
    /// # Errors
    ///
    /// Returns `StackError::InvalidEndpointState` outside a tokio runtime and
    /// `StackError::UnknownProtocol` if the stack has TCP disabled.
    pub fn new(stack: &Stack, options: TcpOptions) -> Result<Self, StackError> {
        let runtime = Handle::try_current().map_err(|_| StackError::InvalidEndpointState)?;
        let max_conns = options.max_conns;
        let inner = Arc::new(TcpInner {
            stats: options.stats.then(|| Arc::new(TcpStats::new())),
            options,
            shutdown: CancellationToken::new(),
            runtime,
        });

        let handler = Arc::clone(&inner);
        let acceptor = stack::TcpForwarder::new(stack, max_conns, move |request| handler.handle_request(request));
        stack.set_transport_protocol_handler(TransportProtocol::Tcp, Arc::new(acceptor))?;
        debug!("TCP forwarder started, max {} flows", max_conns);

        Ok(Self { inner })
    }

    /// Abort every active flow; new flows are reset from now on
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        debug!("TCP forwarder closed");
    }

    /// Snapshot of the counters, `None` when statistics are disabled
    #[must_use]
    pub fn stats(&self) -> Option<TcpStatsSnapshot> {
        self.inner.stats.as_ref().map(|stats| stats.snapshot())
    }
}

impl Drop for TcpForwarder {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl TcpInner {
    fn handle_request(&self, mut request: TcpForwarderRequest) {
        let id = request.id();
        if self.shutdown.is_cancelled() {
            request.complete(true);
            return;
        }

        let mut endpoint = match request.create_endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("TCP flow {}: rejected: {}", id, e);
                request.complete(true);
                return;
            }
        };
        request.complete(false);

        self.configure_keepalive(&mut endpoint);

        let cancel = self.shutdown.child_token();
        match &self.stats {
            Some(stats) => {
                stats.record_conn();
                let stream = StatsStream::new(endpoint, Arc::clone(stats));
                self.runtime.spawn(proxy(stream, id, cancel));
            }
            None => {
                self.runtime.spawn(proxy(endpoint, id, cancel));
            }
        }
    }

    /// Enable keepalive; idle and interval are best-effort
    fn configure_keepalive(&self, endpoint: &mut TcpEndpoint) {
        let id = endpoint.id();
        if let Err(e) = endpoint.set_keepalive(true) {
            debug!("TCP flow {}: cannot enable keepalive: {}", id, e);
            return;
        }
        if let Err(e) = endpoint.set_keepalive_idle(self.options.keepalive_idle()) {
            debug!("TCP flow {}: keepalive idle left at default: {}", id, e);
        }
        if let Err(e) = endpoint.set_keepalive_interval(self.options.keepalive_interval()) {
            debug!("TCP flow {}: keepalive interval left at default: {}", id, e);
        }
    }
}

/// Dial the flow's destination and splice it onto `endpoint`
async fn proxy<S>(mut endpoint: S, id: TransportEndpointId, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let dialed = tokio::select! {
        biased;

        () = cancel.cancelled() => return,
        result = TcpStream::connect(id.local()) => result,
    };
    let mut upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            debug!("TCP flow {}: dial {} failed: {}", id, id.local(), e);
            return;
        }
    };
    trace!("TCP flow {}: connected to {}", id, id.local());

    tokio::select! {
        biased;

        () = cancel.cancelled() => debug!("TCP flow {}: aborted", id),
        result = bidirectional_copy(&mut endpoint, &mut upstream) => {
            if let Some(e) = &result.a_to_b_error {
                debug!("TCP flow {}: sandbox to host copy ended: {}", id, e);
            }
            if let Some(e) = &result.b_to_a_error {
                debug!("TCP flow {}: host to sandbox copy ended: {}", id, e);
            }
            debug!(
                "TCP flow {}: finished, {} bytes out, {} bytes back",
                id, result.a_to_b, result.b_to_a
            );
        }
    }
}
