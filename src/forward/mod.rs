//! Host-side forwarders
//!
//! The forwarders are the stack's transport handlers. They terminate flows
//! opened by the sandbox and re-originate them from host sockets:
//!
//! - [`TcpForwarder`]: accepts each TCP flow and splices it onto a host
//!   connection to the same destination
//! - [`UdpForwarder`]: keeps one connected host socket per UDP flow and relays
//!   replies back through the stack

mod tcp;
mod udp;

pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;
