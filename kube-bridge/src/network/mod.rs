//! Local network provisioning for bridged endpoints
//!
//! A [`NetworkEnvironment`] is owned by one session. It hands out a unique
//! loopback IP per endpoint, picks local ports, makes the IP usable and installs
//! redirect rules, and reverses all of it on teardown. Allocation, rule
//! installation and teardown share one lock and never interleave.

pub mod command;
pub mod hosts;
pub mod probe;
pub mod routing;

use crate::config::NetworkConfig;
use crate::{EndpointInfo, Error, Result};
use command::{CommandRunner, SystemCommandRunner};
use hosts::HostsFileManager;
use probe::{PortProbe, SocketPortProbe};
use routing::{installer_for, Platform, RoutingRuleInstaller};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct NetworkEnvironment {
    state: Mutex<State>,
    probe: Arc<dyn PortProbe>,
    port_range: (u16, u16),
}

#[derive(Debug)]
struct State {
    /// Every IP handed out or reused, with the endpoint it serves
    allocated: HashMap<IpAddr, EndpointInfo>,
    next_ip: u32,
    next_port: u16,
    installer: Box<dyn RoutingRuleInstaller>,
    disposed: bool,
}

impl NetworkEnvironment {
    /// Environment for the current platform, running real OS commands.
    ///
    /// Fails with [`Error::UnsupportedPlatform`] outside Linux, macOS and Windows.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let platform = Platform::current()?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let installer = installer_for(platform, runner, config.command_timeout());
        Self::with_parts(config, installer, Arc::new(SocketPortProbe))
    }

    pub fn with_parts(
        config: &NetworkConfig,
        installer: Box<dyn RoutingRuleInstaller>,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self> {
        if config.port_range_start > config.port_range_end {
            return Err(Error::Config(format!(
                "empty local port range {}-{}",
                config.port_range_start, config.port_range_end
            )));
        }
        info!("Network environment for {:?}", installer.platform());
        Ok(Self {
            state: Mutex::new(State {
                allocated: HashMap::new(),
                next_ip: u32::from(config.ip_start),
                next_port: config.port_range_start,
                installer,
                disposed: false,
            }),
            probe,
            port_range: (config.port_range_start, config.port_range_end),
        })
    }

    /// Give every endpoint a local IP and local ports, enable the IPs, and
    /// optionally install redirect rules. Returns the filled-in endpoints.
    pub async fn allocate_ips(
        &self,
        mut endpoints: Vec<EndpointInfo>,
        add_routing_rules: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<EndpointInfo>> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(Error::InvalidUsage("network environment already disposed".into()));
        }

        for endpoint in endpoints.iter_mut() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let ip = match endpoint.local_ip {
                Some(ip) => {
                    if let Some(owner) = state.allocated.get(&ip) {
                        if owner.dns_name != endpoint.dns_name {
                            return Err(Error::InvalidUsage(format!(
                                "{} is already allocated to {}, cannot also use it for {}",
                                ip, owner.dns_name, endpoint.dns_name
                            )));
                        }
                    }
                    ip
                }
                None => state.next_free_ip()?,
            };

            // probing needs the IP enabled, so a later failure must undo it
            let fresh = !state.allocated.contains_key(&ip);
            if fresh {
                state.installer.enable_ip(ip).await?;
            }
            endpoint.local_ip = Some(ip);
            if let Err(e) = self.provision(&mut state, endpoint, add_routing_rules).await {
                if fresh {
                    if add_routing_rules {
                        if let Err(cleanup) = state.installer.remove_routing_rules(Some(&[ip])).await {
                            warn!("Failed to remove rules for {}: {}", ip, cleanup);
                        }
                    }
                    state.installer.disable_ip(ip).await;
                }
                return Err(e);
            }

            debug!("Allocated {} for {}", ip, endpoint.dns_name);
            state.allocated.insert(ip, endpoint.clone());
        }

        info!("Allocated local addresses for {} endpoints", endpoints.len());
        Ok(endpoints)
    }

    /// Drop hosts entries, disable the IPs and optionally remove their rules.
    ///
    /// Unknown IPs are ignored, so calling this twice is harmless.
    pub async fn free_ips(
        &self,
        ips: &[IpAddr],
        hosts: &dyn HostsFileManager,
        remove_routing_rules: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if ips.is_empty() {
            warn!("No IPs to free");
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut state = self.state.lock().await;
        if let Err(e) = hosts.remove(ips) {
            warn!("Failed to remove hosts entries: {}", e);
        }

        for ip in ips {
            if state.allocated.remove(ip).is_some() {
                state.installer.disable_ip(*ip).await;
                debug!("Freed {}", ip);
            }
        }

        if remove_routing_rules {
            state.installer.remove_routing_rules(Some(ips)).await?;
        }
        Ok(())
    }

    /// Full teardown: disable every tracked IP and remove every tracked rule.
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;

        let ips: Vec<IpAddr> = state.allocated.drain().map(|(ip, _)| ip).collect();
        for ip in &ips {
            state.installer.disable_ip(*ip).await;
        }
        state.installer.remove_routing_rules(None).await?;
        info!("Network environment disposed ({} addresses released)", ips.len());
        Ok(())
    }

    /// Move `remote_port` of the endpoint on `ip` to another free local port.
    ///
    /// Used when binding the probed port failed after all. Rules for `ip` are
    /// reinstalled when `add_routing_rules` is set.
    pub async fn reallocate_port(&self, ip: IpAddr, remote_port: u16, add_routing_rules: bool) -> Result<u16> {
        let mut state = self.state.lock().await;
        if state.installer.pins_local_ports() {
            return Err(Error::InvalidUsage(format!(
                "local port {} on {} is fixed on this platform and cannot be moved",
                remote_port, ip
            )));
        }
        let mut endpoint = state
            .allocated
            .get(&ip)
            .cloned()
            .ok_or_else(|| Error::InvalidUsage(format!("{} is not allocated", ip)))?;
        let used: HashSet<u16> = endpoint.ports.iter().filter_map(|p| p.local_port).collect();
        let port = self.next_free_port(&mut state, ip, &used)?;

        let Some(pair) = endpoint.ports.iter_mut().find(|p| p.remote_port == remote_port) else {
            return Err(Error::InvalidUsage(format!(
                "{} has no remote port {}",
                endpoint.dns_name, remote_port
            )));
        };
        let previous = pair.local_port.replace(port);

        if add_routing_rules {
            state.installer.remove_routing_rules(Some(&[ip])).await?;
            state
                .installer
                .add_routing_rules(std::slice::from_ref(&endpoint))
                .await?;
        }
        debug!(
            "Moved {}:{} from local port {:?} to {}",
            endpoint.dns_name, remote_port, previous, port
        );
        state.allocated.insert(ip, endpoint);
        Ok(port)
    }

    /// Snapshot of the endpoints currently holding an IP.
    pub async fn allocated(&self) -> Vec<EndpointInfo> {
        self.state.lock().await.allocated.values().cloned().collect()
    }

    async fn provision(&self, state: &mut State, endpoint: &mut EndpointInfo, add_routing_rules: bool) -> Result<()> {
        self.assign_ports(state, endpoint)?;
        if add_routing_rules {
            state
                .installer
                .add_routing_rules(std::slice::from_ref(endpoint))
                .await?;
        }
        Ok(())
    }

    fn assign_ports(&self, state: &mut State, endpoint: &mut EndpointInfo) -> Result<()> {
        let ip = endpoint.local_ip.ok_or_else(|| Error::Tunnel("endpoint has no IP".into()))?;
        let pinned = state.installer.pins_local_ports();
        let mut used: HashSet<u16> = HashSet::new();

        for pair in endpoint.ports.iter_mut() {
            let port = if pinned {
                pair.remote_port
            } else {
                match pair.local_port {
                    Some(port) => port,
                    None => self.next_free_port(state, ip, &used)?,
                }
            };
            if !used.insert(port) {
                return Err(Error::InvalidUsage(format!(
                    "local port {} is used twice on {} ({})",
                    port, ip, endpoint.dns_name
                )));
            }
            pair.local_port = Some(port);
        }
        Ok(())
    }

    /// Next bindable port on `ip`, continuing after the last one handed out
    /// and wrapping around the range once.
    fn next_free_port(&self, state: &mut State, ip: IpAddr, used: &HashSet<u16>) -> Result<u16> {
        let (start, end) = self.port_range;
        let first = if state.next_port > end || state.next_port < start {
            start
        } else {
            state.next_port
        };
        let candidates = (first..=end).chain(start..first);

        for port in candidates {
            if used.contains(&port) || !self.probe.is_local_port_available(ip, port) {
                continue;
            }
            state.next_port = port.saturating_add(1);
            return Ok(port);
        }
        Err(Error::InvalidUsage(format!(
            "no free local port in range {}-{} on {}. Free some ports or widen the configured range",
            start, end, ip
        )))
    }
}

impl State {
    fn next_free_ip(&mut self) -> Result<IpAddr> {
        loop {
            let candidate = Ipv4Addr::from(self.next_ip);
            if candidate.octets()[0] != 127 {
                return Err(Error::InvalidUsage(
                    "ran out of loopback addresses to allocate".into(),
                ));
            }
            self.next_ip += 1;
            let ip = IpAddr::V4(candidate);
            let octet = candidate.octets()[3];
            if octet == 0 || octet == 255 || self.allocated.contains_key(&ip) {
                continue;
            }
            return Ok(ip);
        }
    }
}
