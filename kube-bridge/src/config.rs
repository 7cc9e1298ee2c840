//! Configuration for kube-bridge components

use crate::wire::PortForwardStartInfo;
use crate::{EndpointInfo, Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `KUBE_BRIDGE__AGENT_ADDRESS`
pub const ENV_PREFIX: &str = "KUBE_BRIDGE";

/// Configuration for the local proxy session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address of the in-cluster agent's control port
    pub agent_address: SocketAddr,

    /// Local network provisioning
    pub network: NetworkConfig,

    /// Agent liveness probing
    pub ping: PingConfig,

    /// Cluster endpoints the local process needs to reach
    pub endpoints: Vec<EndpointInfo>,

    /// Pod ports whose inbound cluster traffic is forwarded to the local process
    pub reverse_forwards: Vec<PortForwardStartInfo>,
}

/// Local IP/port allocation and routing rule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First loopback address handed out
    pub ip_start: Ipv4Addr,

    /// Inclusive local port range used when ports must be remapped
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Install NAT/pf redirect rules for allocated endpoints
    pub add_routing_rules: bool,

    /// Timeout for every OS command (iptables, pfctl, ifconfig)
    pub command_timeout_secs: u64,

    /// Hosts file endpoint names are registered in; `null` leaves hosts alone
    pub hosts_file: Option<PathBuf>,
}

/// Agent liveness probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Sleep between failed attempts
    pub interval_ms: u64,

    /// Number of attempts before giving up
    pub retries: u32,
}

/// Configuration for the in-cluster agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address to bind the control listener to
    pub bind_address: SocketAddr,

    /// Blocks buffered per forwarding call before writers wait
    pub queue_capacity: usize,

    /// Timeout when dialing a cluster service
    pub connect_timeout_secs: u64,
}

impl NetworkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            agent_address: ([127, 0, 0, 1], crate::DEFAULT_AGENT_PORT).into(),
            network: NetworkConfig::default(),
            ping: PingConfig::default(),
            endpoints: Vec::new(),
            reverse_forwards: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_start: crate::DEFAULT_IP_START.into(),
            port_range_start: crate::DEFAULT_PORT_RANGE_START,
            port_range_end: crate::DEFAULT_PORT_RANGE_END,
            add_routing_rules: true,
            command_timeout_secs: 60,
            hosts_file: Some(crate::network::hosts::system_hosts_path()),
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            retries: 30,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: ([0, 0, 0, 0], crate::DEFAULT_AGENT_PORT).into(),
            queue_capacity: 1000,
            connect_timeout_secs: 10,
        }
    }
}

/// Load configuration from a YAML file, with `KUBE_BRIDGE__*` environment overrides
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Yaml))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    settings
        .try_deserialize()
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
}

/// Save configuration to file
pub fn save_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = serde_yaml::to_string(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
