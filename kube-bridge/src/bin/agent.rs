//! Binary for the in-cluster kube-bridge agent

use clap::Parser;
use kube_bridge::{
    agent::Agent,
    config::{load_config, AgentConfig},
    DEFAULT_AGENT_PORT,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "kube-bridge-agent",
    about = "In-cluster agent that forwards tunnel streams to pods and services",
    version
)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for the control connection
    #[arg(short, long, default_value_t = ([0, 0, 0, 0], DEFAULT_AGENT_PORT).into())]
    bind: SocketAddr,

    /// Blocks buffered per forwarding call
    #[arg(long, default_value_t = 1000)]
    queue_capacity: usize,

    /// Timeout in seconds when dialing a service
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Log level
    #[arg(long, env = "KUBE_BRIDGE_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting kube-bridge agent");

    let config = if let Some(config_path) = args.config {
        load_config::<AgentConfig>(&config_path)?
    } else {
        AgentConfig {
            bind_address: args.bind,
            queue_capacity: args.queue_capacity,
            connect_timeout_secs: args.connect_timeout,
        }
    };

    info!("Agent configuration: {:?}", config);

    let agent = Agent::new(config);
    if let Err(e) = agent.run().await {
        error!("Agent error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
