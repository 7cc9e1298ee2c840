//! Binary for the local kube-bridge session

use clap::Parser;
use kube_bridge::{
    config::{load_config, ProxyConfig},
    proxy::BridgeSession,
    wire::PortForwardStartInfo,
    EndpointInfo, DEFAULT_AGENT_PORT,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "kube-bridge-proxy",
    about = "Bridge a local process into a Kubernetes cluster through the agent",
    version
)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the agent's control port (usually a kubectl port-forward)
    #[arg(short, long, default_value_t = ([127, 0, 0, 1], DEFAULT_AGENT_PORT).into())]
    agent: SocketAddr,

    /// Cluster endpoint to expose locally, as `dns_name:port[,port...]`
    #[arg(short, long = "endpoint", value_parser = parse_endpoint)]
    endpoints: Vec<EndpointInfo>,

    /// Pod port to forward to the local process, as `port[:local_port]`
    #[arg(short, long = "reverse", value_parser = parse_reverse)]
    reverse_forwards: Vec<PortForwardStartInfo>,

    /// Skip installing NAT/pf redirect rules
    #[arg(long)]
    no_routing_rules: bool,

    /// Log level
    #[arg(long, env = "KUBE_BRIDGE_LOG", default_value = "info")]
    log_level: String,
}

fn parse_endpoint(value: &str) -> Result<EndpointInfo, String> {
    let (name, ports) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected dns_name:port, got `{}`", value))?;
    let ports = ports
        .split(',')
        .map(|p| p.parse::<u16>().map_err(|e| format!("bad port `{}`: {}", p, e)))
        .collect::<Result<Vec<u16>, String>>()?;
    Ok(EndpointInfo::new(name, &ports))
}

fn parse_reverse(value: &str) -> Result<PortForwardStartInfo, String> {
    let parse = |p: &str| p.parse::<u16>().map_err(|e| format!("bad port `{}`: {}", p, e));
    let (port, local_port) = match value.split_once(':') {
        Some((port, local)) => (parse(port)?, Some(parse(local)?)),
        None => (parse(value)?, None),
    };
    Ok(PortForwardStartInfo {
        port,
        local_port,
        http_probes: Vec::new(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting kube-bridge proxy");

    let config = if let Some(config_path) = args.config {
        load_config::<ProxyConfig>(&config_path)?
    } else {
        let mut config = ProxyConfig::default();
        config.agent_address = args.agent;
        config.endpoints = args.endpoints;
        config.reverse_forwards = args.reverse_forwards;
        config.network.add_routing_rules = !args.no_routing_rules;
        config
    };

    info!("Proxy configuration: {:?}", config);

    let mut session = BridgeSession::new(config)?;
    info!("Session id: {}", session.id());

    if let Err(e) = session.run().await {
        error!("Proxy error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
