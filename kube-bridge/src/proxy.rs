//! Local bridge session
//!
//! A [`BridgeSession`] makes cluster endpoints reachable from the local machine
//! and cluster traffic for the workload reach the local process. Each endpoint
//! port gets a local listener whose connections become service streams; each
//! reverse forward bridges agent-side connections to a local port.

use crate::config::ProxyConfig;
use crate::network::hosts::{HostsFileManager, MarkedHostsFile, NoHostsFile};
use crate::network::NetworkEnvironment;
use crate::tunnel::{ForwardTarget, StreamHandler, TunnelClient, READ_CHUNK_SIZE, SOCKET_WRITE_QUEUE};
use crate::wire::PortForwardStartInfo;
use crate::{EndpointInfo, Error, PortPair, Result, StreamId};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Attempts to bind a local listener before giving up on a port pair
const BIND_ATTEMPTS: usize = 5;

const STOP_WAIT: Duration = Duration::from_secs(10);

/// One local bridging session against one agent.
#[derive(Debug)]
pub struct BridgeSession {
    id: Uuid,
    config: ProxyConfig,
    network: Arc<NetworkEnvironment>,
    hosts: Arc<dyn HostsFileManager>,
    client: TunnelClient,
    endpoints: Vec<EndpointInfo>,
    listeners: Vec<SocketAddr>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stopped: bool,
}

impl BridgeSession {
    /// Create a session for the current platform.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let network = NetworkEnvironment::new(&config.network)?;
        let hosts: Arc<dyn HostsFileManager> = match &config.network.hosts_file {
            Some(path) => Arc::new(MarkedHostsFile::new(path)),
            None => Arc::new(NoHostsFile),
        };
        Ok(Self::with_network(config, network, hosts))
    }

    pub fn with_network(
        config: ProxyConfig,
        network: NetworkEnvironment,
        hosts: Arc<dyn HostsFileManager>,
    ) -> Self {
        let client = TunnelClient::new(config.agent_address.to_string());
        Self {
            id: Uuid::new_v4(),
            config,
            network: Arc::new(network),
            hosts,
            client,
            endpoints: Vec::new(),
            listeners: Vec::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stopped: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoints with their allocated IPs and ports, once started.
    pub fn endpoints(&self) -> &[EndpointInfo] {
        &self.endpoints
    }

    /// Addresses of the local listeners, once started.
    pub fn listeners(&self) -> &[SocketAddr] {
        &self.listeners
    }

    pub fn client(&self) -> &TunnelClient {
        &self.client
    }

    /// Provision the network, reach the agent and start forwarding.
    pub async fn start(&mut self) -> Result<()> {
        let span = info_span!("session", id = %self.id);
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<()> {
        info!(
            "Starting bridge session against {} ({} endpoints, {} reverse forwards)",
            self.config.agent_address,
            self.config.endpoints.len(),
            self.config.reverse_forwards.len()
        );
        let add_rules = self.config.network.add_routing_rules;

        self.endpoints = self
            .network
            .allocate_ips(self.config.endpoints.clone(), add_rules, &self.shutdown)
            .await?;

        let entries: Vec<(IpAddr, String)> = self
            .endpoints
            .iter()
            .filter_map(|e| e.local_ip.map(|ip| (ip, e.dns_name.clone())))
            .collect();
        if !entries.is_empty() {
            self.hosts.add(&entries)?;
        }

        let ping = &self.config.ping;
        if !self.client.ping(ping.interval_ms, ping.retries).await {
            return Err(Error::Agent(format!(
                "agent at {} did not answer after {} attempts",
                self.config.agent_address, ping.retries
            )));
        }
        self.client.reset().await;

        for index in 0..self.endpoints.len() {
            let endpoint = self.endpoints[index].clone();
            let Some(ip) = endpoint.local_ip else { continue };
            for pair in &endpoint.ports {
                let (listener, local_port) = self.bind_port_pair(ip, pair).await?;
                if Some(local_port) != pair.local_port {
                    if let Some(moved) = self.endpoints[index]
                        .ports
                        .iter_mut()
                        .find(|p| p.remote_port == pair.remote_port)
                    {
                        moved.local_port = Some(local_port);
                    }
                }
                let target = ForwardTarget::service(endpoint.dns_name.clone(), pair.remote_port);
                info!("{}:{} -> {}:{}", ip, local_port, endpoint.dns_name, pair.remote_port);
                self.listeners.push(SocketAddr::new(ip, local_port));
                self.tasks.spawn(serve_service_listener(
                    listener,
                    target,
                    self.client.clone(),
                    self.tasks.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        for info in self.config.reverse_forwards.clone() {
            self.spawn_reverse_forward(info);
        }
        info!("Bridge session started");
        Ok(())
    }

    /// Bind `(ip, local_port)`, moving to another port when the probed one
    /// turned out to be taken.
    async fn bind_port_pair(&self, ip: IpAddr, pair: &PortPair) -> Result<(TcpListener, u16)> {
        let mut local_port = pair
            .local_port
            .ok_or_else(|| Error::InvalidUsage(format!("remote port {} has no local port", pair.remote_port)))?;

        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind((ip, local_port)).await {
                Ok(listener) => return Ok((listener, local_port)),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!("{}:{} is taken, picking another local port", ip, local_port);
                    local_port = self
                        .network
                        .reallocate_port(ip, pair.remote_port, self.config.network.add_routing_rules)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::InvalidUsage(format!(
            "could not bind a local port for {}:{} after {} attempts",
            ip, pair.remote_port, BIND_ATTEMPTS
        )))
    }

    fn spawn_reverse_forward(&self, info: PortForwardStartInfo) {
        let local_port = info.local_port.unwrap_or(info.port);
        let handler = Arc::new(ReverseBridge {
            target: ForwardTarget::Reverse { port: info.port },
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_port),
            client: self.client.clone(),
            sockets: DashMap::new(),
            tasks: self.tasks.clone(),
            shutdown: self.shutdown.clone(),
        });
        let client = self.client.clone();
        let cancel = self.shutdown.child_token();
        info!("Cluster port {} -> 127.0.0.1:{}", info.port, local_port);

        self.tasks.spawn(async move {
            let port = info.port;
            if let Err(e) = client
                .reverse_port_forward_start(info, handler.clone(), cancel)
                .await
            {
                error!("Reverse port forward on {} failed: {}", port, e);
            }
            handler.close_all();
        });
    }

    /// Wait for ctrl-c, then stop.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            if let Err(cleanup) = self.stop().await {
                warn!("Cleanup after failed start also failed: {}", cleanup);
            }
            return Err(e);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            _ = self.shutdown.cancelled() => {}
        }
        self.stop().await
    }

    /// Stop forwarding and undo every local network change.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!(session = %self.id, "Stopping bridge session");

        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(STOP_WAIT, self.tasks.wait()).await.is_err() {
            warn!("Timed out waiting for session tasks");
        }
        self.client.shutdown().await;

        let ips: Vec<IpAddr> = self.endpoints.iter().filter_map(|e| e.local_ip).collect();
        if let Err(e) = self
            .network
            .free_ips(
                &ips,
                self.hosts.as_ref(),
                self.config.network.add_routing_rules,
                &CancellationToken::new(),
            )
            .await
        {
            warn!("Failed to free local addresses: {}", e);
        }
        self.network.dispose().await
    }
}

async fn serve_service_listener(
    listener: TcpListener,
    target: ForwardTarget,
    client: TunnelClient,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(forward = %target, "Accepted local connection from {}", peer);
                let _ = socket.set_nodelay(true);
                tasks.spawn(bridge_service_socket(
                    socket,
                    target.clone(),
                    client.clone(),
                    tasks.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!(forward = %target, "Failed to accept local connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Carry one local connection over a service stream.
async fn bridge_service_socket(
    socket: TcpStream,
    target: ForwardTarget,
    client: TunnelClient,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    let ForwardTarget::Service(key) = &target else {
        return;
    };
    let (reader, writer) = socket.into_split();
    let local = LocalSocket::spawn(writer, &tasks, &shutdown);
    let cancel = shutdown.child_token();

    let stream_id = match client
        .service_port_forward_start(&key.service_dns, key.port, local.clone(), cancel.clone())
        .await
    {
        Ok(Some(stream_id)) => stream_id,
        Ok(None) => {
            info!(forward = %target, "Agent could not reach the service");
            local.close();
            return;
        }
        Err(e) => {
            warn!(forward = %target, "Failed to open service stream: {}", e);
            local.close();
            return;
        }
    };

    pump_to_tunnel(reader, &target, stream_id, &client, &local, &shutdown).await;
    cancel.cancel();
}

/// Send everything read from `reader` into `stream_id` until either side closes.
async fn pump_to_tunnel(
    mut reader: OwnedReadHalf,
    target: &ForwardTarget,
    stream_id: StreamId,
    client: &TunnelClient,
    local: &LocalSocket,
    shutdown: &CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = local.closed.cancelled() => return,
            _ = shutdown.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let content = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = client.send_data(target, stream_id, content).await {
                    warn!(forward = %target, stream_id, "Dropping stream: {}", e);
                    break;
                }
            }
            Err(e) => {
                debug!(forward = %target, stream_id, "Local read failed: {}", e);
                break;
            }
        }
    }
    client.stop(target, stream_id).await;
}

/// Write side of a local socket fed by tunnel data.
///
/// Bytes go through a bounded queue drained by a writer task, so a local
/// reader that falls behind only holds up its own stream.
#[derive(Debug)]
struct LocalSocket {
    write_tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: CancellationToken,
}

impl LocalSocket {
    fn spawn(writer: OwnedWriteHalf, tasks: &TaskTracker, shutdown: &CancellationToken) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(SOCKET_WRITE_QUEUE);
        tasks.spawn(drain_to_socket(writer, write_rx, shutdown.clone()));
        Arc::new(Self {
            write_tx: std::sync::Mutex::new(Some(write_tx)),
            closed: CancellationToken::new(),
        })
    }

    fn sender(&self) -> Result<mpsc::Sender<Bytes>> {
        let write_tx = self
            .write_tx
            .lock()
            .map_err(|_| Error::Tunnel("local socket lock poisoned".to_string()))?;
        write_tx
            .clone()
            .ok_or_else(|| Error::Tunnel("local socket already closed".to_string()))
    }

    /// Queue `content`, waiting while the local reader catches up.
    async fn write(&self, content: Bytes) -> Result<()> {
        self.sender()?
            .send(content)
            .await
            .map_err(|_| Error::Tunnel("local socket already closed".to_string()))
    }

    /// Queue `content` without waiting.
    fn try_write(&self, content: Bytes) -> Result<()> {
        match self.sender()?.try_send(content) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::Tunnel("local connection is not keeping up".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(Error::Tunnel("local socket already closed".to_string())),
        }
    }

    /// Flush what is queued, then shut the write side down.
    fn close(&self) {
        self.closed.cancel();
        if let Ok(mut write_tx) = self.write_tx.lock() {
            write_tx.take();
        }
    }
}

async fn drain_to_socket(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let content = tokio::select! {
            _ = shutdown.cancelled() => break,
            content = write_rx.recv() => match content {
                Some(content) => content,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = shutdown.cancelled() => break,
            written = writer.write_all(&content) => written,
        };
        if let Err(e) = written {
            debug!("Local write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl StreamHandler for LocalSocket {
    fn on_data(&self, _stream_id: StreamId, content: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write(content))
    }

    fn on_closed(&self, _stream_id: StreamId) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.close() })
    }
}

/// Bridges reverse-forward streams to a local port, one connection per stream.
#[derive(Debug)]
struct ReverseBridge {
    target: ForwardTarget,
    local_addr: SocketAddr,
    client: TunnelClient,
    sockets: DashMap<StreamId, Arc<LocalSocket>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ReverseBridge {
    fn close_all(&self) {
        let sockets: Vec<Arc<LocalSocket>> = self.sockets.iter().map(|e| e.value().clone()).collect();
        self.sockets.clear();
        for socket in sockets {
            socket.close();
        }
    }
}

impl StreamHandler for ReverseBridge {
    fn on_connected(&self, stream_id: StreamId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let socket = TcpStream::connect(self.local_addr).await.map_err(|e| {
                Error::Tunnel(format!("cannot reach local process at {}: {}", self.local_addr, e))
            })?;
            let _ = socket.set_nodelay(true);
            let (reader, writer) = socket.into_split();
            let local = LocalSocket::spawn(writer, &self.tasks, &self.shutdown);
            self.sockets.insert(stream_id, local.clone());
            debug!(forward = %self.target, stream_id, "Bridged to {}", self.local_addr);

            let target = self.target.clone();
            let client = self.client.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(async move {
                pump_to_tunnel(reader, &target, stream_id, &client, &local, &shutdown).await;
            });
            Ok(())
        })
    }

    fn on_data(&self, stream_id: StreamId, content: Bytes) -> BoxFuture<'_, Result<()>> {
        let written = match self.sockets.get(&stream_id) {
            Some(local) => local.try_write(content),
            None => Err(Error::Tunnel(format!("no local connection for stream {}", stream_id))),
        };
        Box::pin(async move { written })
    }

    fn on_closed(&self, stream_id: StreamId) -> BoxFuture<'_, ()> {
        if let Some((_, local)) = self.sockets.remove(&stream_id) {
            local.close();
        }
        Box::pin(async {})
    }
}
