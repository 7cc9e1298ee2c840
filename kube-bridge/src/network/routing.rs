//! Platform routing rules that redirect `(LocalIP, RemotePort)` to `(LocalIP, LocalPort)`
//!
//! Linux installs one iptables NAT rule per chain and port pair, tracked by
//! literal rule text. macOS has no incremental equivalent: the whole `rdr`
//! ruleset is rebuilt and loaded into pf on every change. Windows has no
//! usable redirect primitive, so local ports are pinned to the remote ports.

use super::command::CommandRunner;
use crate::{EndpointInfo, Error, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Platform this binary runs on; anything else is unsupported.
    pub fn current() -> Result<Self> {
        if cfg!(target_os = "linux") {
            Ok(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Ok(Platform::MacOs)
        } else if cfg!(target_os = "windows") {
            Ok(Platform::Windows)
        } else {
            Err(Error::UnsupportedPlatform(std::env::consts::OS.to_string()))
        }
    }
}

/// Per-platform capability set used by the network environment.
pub trait RoutingRuleInstaller: Send + Sync + std::fmt::Debug {
    fn platform(&self) -> Platform;

    /// Local ports must equal remote ports when no redirect can be installed.
    fn pins_local_ports(&self) -> bool {
        false
    }

    /// Make `ip` bindable on this host.
    fn enable_ip(&mut self, ip: IpAddr) -> BoxFuture<'_, Result<()>> {
        let _ = ip;
        Box::pin(async { Ok(()) })
    }

    /// Reverse [`RoutingRuleInstaller::enable_ip`]; best effort.
    fn disable_ip(&mut self, ip: IpAddr) -> BoxFuture<'_, ()> {
        let _ = ip;
        Box::pin(async {})
    }

    fn add_routing_rules<'a>(&'a mut self, endpoints: &'a [EndpointInfo]) -> BoxFuture<'a, Result<()>>;

    /// Remove rules for `ips`, or every tracked rule when `ips` is `None`.
    fn remove_routing_rules<'a>(&'a mut self, ips: Option<&'a [IpAddr]>) -> BoxFuture<'a, Result<()>>;
}

/// Pick the installer for `platform`.
pub fn installer_for(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
) -> Box<dyn RoutingRuleInstaller> {
    match platform {
        Platform::Linux => Box::new(LinuxRules::new(runner, timeout)),
        Platform::MacOs => Box::new(MacRules::new(runner, timeout)),
        Platform::Windows => Box::new(WindowsRules),
    }
}

/// Port pairs of `endpoint` that actually need a redirect.
fn redirects(endpoint: &EndpointInfo) -> impl Iterator<Item = (IpAddr, u16, u16)> + '_ {
    endpoint.local_ip.into_iter().flat_map(move |ip| {
        endpoint.ports.iter().filter_map(move |pair| match pair.local_port {
            Some(local) if local != pair.remote_port => Some((ip, pair.remote_port, local)),
            _ => None,
        })
    })
}

fn matches_ips(ip: &IpAddr, ips: Option<&[IpAddr]>) -> bool {
    ips.map_or(true, |ips| ips.contains(ip))
}

/// iptables DNAT rules, installed and removed one by one.
#[derive(Debug)]
pub struct LinuxRules {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    /// Installed rule text -> the IP it belongs to
    rules: BTreeMap<String, IpAddr>,
}

const NAT_CHAINS: [&str; 2] = ["PREROUTING", "OUTPUT"];

impl LinuxRules {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            rules: BTreeMap::new(),
        }
    }

    pub fn rule_text(chain: &str, ip: IpAddr, remote_port: u16, local_port: u16) -> String {
        format!(
            "-t nat -A {} -p tcp -d {} --dport {} -j DNAT --to-destination {}:{}",
            chain, ip, remote_port, ip, local_port
        )
    }

    pub fn tracked_rules(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    async fn iptables(&self, rule: &str) -> Result<()> {
        // -w waits on the xtables lock instead of failing when it is held
        let args: Vec<String> = std::iter::once("-w".to_string())
            .chain(rule.split_whitespace().map(str::to_string))
            .collect();
        let output = self.runner.run("iptables", &args, None, self.timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::InvalidUsage(format!(
                "running iptables failed with exit code {}: {}. Make sure iptables is installed and the proxy runs as root",
                output.exit_code,
                output.error_message()
            )))
        }
    }
}

impl RoutingRuleInstaller for LinuxRules {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn add_routing_rules<'a>(&'a mut self, endpoints: &'a [EndpointInfo]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for endpoint in endpoints {
                for (ip, remote, local) in redirects(endpoint) {
                    for chain in NAT_CHAINS {
                        let rule = Self::rule_text(chain, ip, remote, local);
                        if self.rules.contains_key(&rule) {
                            debug!("Rule already installed: {}", rule);
                            continue;
                        }
                        self.iptables(&rule).await?;
                        info!("Installed iptables rule: {}", rule);
                        self.rules.insert(rule, ip);
                    }
                }
            }
            Ok(())
        })
    }

    fn remove_routing_rules<'a>(&'a mut self, ips: Option<&'a [IpAddr]>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let doomed: Vec<String> = self
                .rules
                .iter()
                .filter(|(_, ip)| matches_ips(ip, ips))
                .map(|(rule, _)| rule.clone())
                .collect();

            for rule in doomed {
                self.rules.remove(&rule);
                let delete = rule.replacen(" -A ", " -D ", 1);
                match self.iptables(&delete).await {
                    Ok(()) => debug!("Removed iptables rule: {}", rule),
                    Err(e) => warn!("Failed to remove iptables rule {}: {}", rule, e),
                }
            }
            Ok(())
        })
    }
}

/// pf `rdr` rules, reloaded wholesale on every change.
///
/// The NAT ruleset that was active before the first load is kept and loaded
/// ahead of our rules, and restored once every rule has been removed.
#[derive(Debug)]
pub struct MacRules {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    rules: BTreeMap<IpAddr, Vec<String>>,
    snapshot: Option<String>,
    enable_token: Option<String>,
}

impl MacRules {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            rules: BTreeMap::new(),
            snapshot: None,
            enable_token: None,
        }
    }

    pub fn rdr_rule(ip: IpAddr, remote_port: u16, local_port: u16) -> String {
        format!(
            "rdr pass on lo0 inet proto tcp from any to {} port {} -> {} port {}",
            ip, remote_port, ip, local_port
        )
    }

    /// Full NAT ruleset text: the user's previous rules, then ours.
    pub fn ruleset(&self) -> String {
        let mut text = String::new();
        if let Some(snapshot) = &self.snapshot {
            text.push_str(snapshot);
        }
        for rule in self.rules.values().flatten() {
            text.push_str(rule);
            text.push('\n');
        }
        text
    }

    async fn pfctl(&self, args: &[&str], stdin: Option<&str>) -> Result<super::command::CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run("pfctl", &args, stdin, self.timeout).await
    }

    async fn take_snapshot(&mut self) {
        if self.snapshot.is_some() {
            return;
        }
        let snapshot = match self.pfctl(&["-s", "nat"], None).await {
            Ok(out) if out.success() => out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| format!("{}\n", l))
                .collect(),
            Ok(out) => {
                warn!("Could not read current pf NAT rules: {}", out.error_message());
                String::new()
            }
            Err(e) => {
                warn!("Could not read current pf NAT rules: {}", e);
                String::new()
            }
        };
        self.snapshot = Some(snapshot);
    }

    /// Load the current ruleset; failures only degrade connectivity.
    async fn load(&mut self) {
        let ruleset = self.ruleset();
        match self.pfctl(&["-E", "-N", "-f", "-"], Some(&ruleset)).await {
            Ok(out) if out.success() => {
                if self.enable_token.is_none() {
                    self.enable_token = parse_enable_token(&out.stdout)
                        .or_else(|| parse_enable_token(&out.stderr));
                }
                debug!("Loaded pf ruleset:\n{}", ruleset);
            }
            Ok(out) => warn!(
                "Loading pf rules failed with exit code {}: {}. Redirected ports will not work",
                out.exit_code,
                out.error_message()
            ),
            Err(e) => warn!("Loading pf rules failed: {}. Redirected ports will not work", e),
        }
    }

    async fn restore(&mut self) {
        let snapshot = self.snapshot.take().unwrap_or_default();
        let result = if snapshot.is_empty() {
            self.pfctl(&["-F", "nat"], None).await
        } else {
            self.pfctl(&["-N", "-f", "-"], Some(&snapshot)).await
        };
        match result {
            Ok(out) if out.success() => info!("Restored previous pf NAT rules"),
            Ok(out) => warn!("Failed to restore pf NAT rules: {}", out.error_message()),
            Err(e) => warn!("Failed to restore pf NAT rules: {}", e),
        }

        if let Some(token) = self.enable_token.take() {
            if let Err(e) = self.pfctl(&["-X", token.as_str()], None).await {
                warn!("Failed to release pf enable token: {}", e);
            }
        }
    }
}

fn parse_enable_token(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Token").then(|| value.trim().to_string())
    })
}

impl RoutingRuleInstaller for MacRules {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn enable_ip(&mut self, ip: IpAddr) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let args = vec![
                "lo0".to_string(),
                "alias".to_string(),
                ip.to_string(),
                "netmask".to_string(),
                "255.255.255.255".to_string(),
            ];
            let output = self.runner.run("ifconfig", &args, None, self.timeout).await?;
            if !output.success() {
                return Err(Error::InvalidUsage(format!(
                    "aliasing {} on lo0 failed with exit code {}: {}",
                    ip,
                    output.exit_code,
                    output.error_message()
                )));
            }
            debug!("Aliased {} on lo0", ip);
            Ok(())
        })
    }

    fn disable_ip(&mut self, ip: IpAddr) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let args = vec!["lo0".to_string(), "-alias".to_string(), ip.to_string()];
            match self.runner.run("ifconfig", &args, None, self.timeout).await {
                Ok(out) if out.success() => debug!("Removed lo0 alias {}", ip),
                Ok(out) => warn!("Failed to remove lo0 alias {}: {}", ip, out.error_message()),
                Err(e) => warn!("Failed to remove lo0 alias {}: {}", ip, e),
            }
        })
    }

    fn add_routing_rules<'a>(&'a mut self, endpoints: &'a [EndpointInfo]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut changed = false;
            for endpoint in endpoints {
                for (ip, remote, local) in redirects(endpoint) {
                    let rule = Self::rdr_rule(ip, remote, local);
                    let rules = self.rules.entry(ip).or_default();
                    if !rules.contains(&rule) {
                        rules.push(rule);
                        changed = true;
                    }
                }
            }
            if changed {
                self.take_snapshot().await;
                self.load().await;
            }
            Ok(())
        })
    }

    fn remove_routing_rules<'a>(&'a mut self, ips: Option<&'a [IpAddr]>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let before = self.rules.len();
            self.rules.retain(|ip, _| !matches_ips(ip, ips));
            if self.rules.len() == before || self.snapshot.is_none() {
                return Ok(());
            }
            if self.rules.is_empty() {
                self.restore().await;
            } else {
                self.load().await;
            }
            Ok(())
        })
    }
}

/// No redirect primitive; local ports are pinned to remote ports instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRules;

impl RoutingRuleInstaller for WindowsRules {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn pins_local_ports(&self) -> bool {
        true
    }

    fn add_routing_rules<'a>(&'a mut self, _endpoints: &'a [EndpointInfo]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async {
            debug!("No routing rules on Windows; local ports equal remote ports");
            Ok(())
        })
    }

    fn remove_routing_rules<'a>(&'a mut self, _ips: Option<&'a [IpAddr]>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
