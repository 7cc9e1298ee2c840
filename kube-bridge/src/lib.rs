//! Kube Bridge - run a local process as if it were inside a Kubernetes cluster
//!
//! Two halves make up the bridge. The [`network`] module provisions the local
//! side: a unique loopback IP per cluster endpoint, free local ports, and the
//! OS redirect rules that make `(LocalIP, RemotePort)` reach the local
//! listener. The [`tunnel`] module multiplexes any number of TCP streams over a
//! single control connection between the local [`tunnel::TunnelClient`] and the
//! in-cluster [`tunnel::TunnelControlEndpoint`].

pub mod agent;
pub mod config;
pub mod error;
pub mod network;
pub mod proxy;
pub mod rpc;
pub mod tunnel;
pub mod wire;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A remote/local port mapping for one endpoint.
///
/// `local_port` is `None` until the network environment picks one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub remote_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl PortPair {
    pub fn new(remote_port: u16) -> Self {
        Self {
            remote_port,
            local_port: None,
        }
    }
}

/// A cluster-reachable service or external endpoint the local process talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Stable key, e.g. `orders.shop.svc.cluster.local`.
    pub dns_name: String,
    #[serde(default)]
    pub local_ip: Option<IpAddr>,
    #[serde(default)]
    pub ports: Vec<PortPair>,
    #[serde(default)]
    pub is_external_endpoint: bool,
    #[serde(default)]
    pub is_in_workload_namespace: bool,
}

impl EndpointInfo {
    pub fn new(dns_name: impl Into<String>, remote_ports: &[u16]) -> Self {
        Self {
            dns_name: dns_name.into(),
            local_ip: None,
            ports: remote_ports.iter().copied().map(PortPair::new).collect(),
            is_external_endpoint: false,
            is_in_workload_namespace: false,
        }
    }
}

/// Multiplexing key for one logical TCP connection inside a forwarding target.
pub type StreamId = i32;

/// Default port the in-cluster agent listens on
pub const DEFAULT_AGENT_PORT: u16 = 50051;

/// First address handed out to endpoints without a caller-specified IP
pub const DEFAULT_IP_START: [u8; 4] = [127, 1, 1, 1];

/// First local port probed on platforms that redirect ports
pub const DEFAULT_PORT_RANGE_START: u16 = 55049;

/// Last local port probed on platforms that redirect ports
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;
