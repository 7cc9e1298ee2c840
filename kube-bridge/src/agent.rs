//! In-cluster agent serving the tunnel control connection

use crate::{config::AgentConfig, rpc, tunnel::TunnelControlEndpoint, Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Agent that owns the connectors of every forwarding target
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    endpoint: Arc<TunnelControlEndpoint>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Agent {
    /// Create a new agent
    pub fn new(config: AgentConfig) -> Self {
        let endpoint = Arc::new(TunnelControlEndpoint::from_config(&config));
        Self {
            config,
            endpoint,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Bind the control listener configured for this agent
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            Error::Agent(format!("Failed to bind {}: {}", self.config.bind_address, e))
        })?;
        info!("Agent listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve until ctrl-c, then shut down
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        let result = tokio::select! {
            result = self.serve(listener) => result,
            signal = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                signal.map_err(Error::Io)
            }
        };
        self.shutdown().await;
        result
    }

    /// Accept control connections until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("Control connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let endpoint = self.endpoint.clone();
                    let shutdown = self.shutdown.clone();
                    self.tasks.spawn(async move {
                        if let Err(e) = rpc::serve_connection(stream, endpoint, shutdown).await {
                            warn!("Control connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Stop serving and tear down every port forward
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.endpoint.reset().await;
        info!("Agent stopped");
    }

    pub fn endpoint(&self) -> &Arc<TunnelControlEndpoint> {
        &self.endpoint
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.config.bind_address
    }
}
