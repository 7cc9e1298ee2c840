//! Stream multiplexing over the control connection
//!
//! The agent side owns real sockets through [`connector::StreamConnector`]s,
//! one per [`ForwardTarget`], and exposes them through
//! [`endpoint::TunnelControlEndpoint`]. The local side drives everything
//! through [`client::TunnelClient`].

pub mod client;
pub mod connector;
pub mod endpoint;
pub mod probe;
pub mod registry;

pub use client::{StreamHandler, TunnelClient};
pub use connector::{BlockSink, ReverseConnector, ServiceConnector, StreamConnector, WriteReceipt};
pub use endpoint::TunnelControlEndpoint;
pub use registry::ConnectorRegistry;

use serde::{Deserialize, Serialize};

/// Socket reads are forwarded in chunks of at most this many bytes
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Chunks queued for one socket; a `Send*` beyond this closes the stream
pub const SOCKET_WRITE_QUEUE: usize = 64;

/// Blocks queued per forwarding call before producers wait
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Identifies one multiplexing group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardTarget {
    /// Cluster -> local: the agent listens on `port` inside the pod
    Reverse { port: u16 },
    /// Local -> cluster: the agent dials `service_dns:port`
    Service(ServiceKey),
}

/// Registry key of a service forwarding target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_dns: String,
    pub port: u16,
}

impl ServiceKey {
    pub fn new(service_dns: impl Into<String>, port: u16) -> Self {
        Self {
            service_dns: service_dns.into(),
            port,
        }
    }
}

impl ForwardTarget {
    pub fn service(service_dns: impl Into<String>, port: u16) -> Self {
        ForwardTarget::Service(ServiceKey::new(service_dns, port))
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service_dns, self.port)
    }
}

impl std::fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardTarget::Reverse { port } => write!(f, "reverse:{}", port),
            ForwardTarget::Service(key) => write!(f, "service:{}", key),
        }
    }
}
