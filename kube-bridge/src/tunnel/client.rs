//! Local side of the tunnel
//!
//! [`TunnelClient`] is a cheap handle over one lazily created control
//! connection. Callers never see the connection itself: when the agent goes
//! away the cached connection is dropped and the next call reconnects.

use super::ForwardTarget;
use crate::rpc::RpcConnection;
use crate::wire::{PortForwardStartInfo, Reply, Request, StreamBlock, StreamFlag};
use crate::{Error, Result, StreamId};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Upper bound for draining background tasks on shutdown
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Receives the events of forwarded streams on the local side.
///
/// All streams of one reverse forward are delivered from a single loop, so
/// handlers should hand data off instead of waiting on a slow consumer.
pub trait StreamHandler: Send + Sync {
    /// A new stream was accepted on the agent.
    fn on_connected(&self, _stream_id: StreamId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// An error closes the stream: the agent is asked to stop it and
    /// `on_closed` follows.
    fn on_data(&self, stream_id: StreamId, content: Bytes) -> BoxFuture<'_, Result<()>>;

    fn on_closed(&self, stream_id: StreamId) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone)]
pub struct TunnelClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    agent_address: String,
    connection: ArcSwapOption<RpcConnection>,
    connect_permit: Semaphore,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(agent_address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_address: agent_address.into(),
                connection: ArcSwapOption::empty(),
                connect_permit: Semaphore::new(1),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn agent_address(&self) -> &str {
        &self.inner.agent_address
    }

    fn live_connection(&self) -> Option<Arc<RpcConnection>> {
        let current = self.inner.connection.load_full();
        match &current {
            Some(connection) if !connection.is_closed() => return Some(connection.clone()),
            Some(_) => {}
            None => return None,
        }
        debug!("Dropping closed control connection");
        self.inner.connection.compare_and_swap(&current, None::<Arc<RpcConnection>>);
        None
    }

    /// Shared connection, created on first use.
    async fn connection(&self) -> Result<Arc<RpcConnection>> {
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }
        let _permit = self
            .inner
            .connect_permit
            .acquire()
            .await
            .map_err(|_| Error::Tunnel("tunnel client is shut down".to_string()))?;
        // someone else may have connected while we waited
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Tunnel("tunnel client is shut down".to_string()));
        }

        let connection = Arc::new(RpcConnection::connect(self.inner.agent_address.as_str()).await?);
        info!("Connected to agent at {}", self.inner.agent_address);
        self.inner.connection.store(Some(connection.clone()));
        Ok(connection)
    }

    async fn call(&self, request: Request, payload: Bytes) -> Result<Reply> {
        self.connection().await?.call(request, payload).await
    }

    async fn open_stream(&self, request: Request) -> Result<mpsc::Receiver<Result<StreamBlock>>> {
        self.connection().await?.open_stream(request).await
    }

    /// Ping the agent up to `retries` times, waiting `timeout_ms` per attempt
    /// and between attempts.
    pub async fn ping(&self, timeout_ms: u64, retries: u32) -> bool {
        let interval = Duration::from_millis(timeout_ms);
        for attempt in 1..=retries {
            match tokio::time::timeout(interval, self.call(Request::Ping, Bytes::new())).await {
                Ok(Ok(_)) => {
                    debug!(attempt, "Agent answered ping");
                    return true;
                }
                Ok(Err(e)) => debug!(attempt, "Ping failed: {}", e),
                Err(_) => debug!(attempt, "Ping timed out"),
            }
            if attempt < retries {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        warn!("Agent at {} did not answer {} pings", self.inner.agent_address, retries);
        false
    }

    /// Bring the agent back to a clean state. Failures are only logged.
    pub async fn reset(&self) {
        match self.call(Request::Reset, Bytes::new()).await {
            Ok(_) => debug!("Agent reset"),
            Err(e) => warn!("Failed to reset agent: {}", e),
        }
    }

    /// Forward connections accepted on `info.port` inside the pod to `handler`.
    ///
    /// Runs until `cancel` fires, the client shuts down or the agent ends the
    /// forward. Streams still open when `cancel` fires are stopped on the agent.
    pub async fn reverse_port_forward_start(
        &self,
        info: PortForwardStartInfo,
        handler: Arc<dyn StreamHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let target = ForwardTarget::Reverse { port: info.port };
        let mut blocks = self.open_stream(Request::RunReversePortForward(info)).await?;
        info!(forward = %target, "Reverse port forward started");

        let mut open: HashMap<StreamId, CancellationToken> = HashMap::new();
        let mut stopping: HashSet<StreamId> = HashSet::new();

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                next = blocks.recv() => next,
            };
            let block = match next {
                Some(Ok(block)) => block,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            let stream_id = block.stream_id;

            match block.flag {
                StreamFlag::Connected => {
                    if open.contains_key(&stream_id) || stopping.contains(&stream_id) {
                        break Err(Error::Protocol(format!(
                            "stream {}: expect flag 2 or 3, got {}",
                            stream_id, block.flag
                        )));
                    }
                    let done = CancellationToken::new();
                    self.stop_on_cancel(target.clone(), stream_id, cancel.clone(), done.clone());
                    open.insert(stream_id, done);

                    if let Err(e) = handler.on_connected(stream_id).await {
                        warn!(forward = %target, stream_id, "Local side refused stream: {}", e);
                        self.abandon(&target, stream_id, &mut open, &mut stopping, handler.as_ref())
                            .await;
                    }
                }
                StreamFlag::Data => {
                    if stopping.contains(&stream_id) {
                        debug!(stream_id, "Dropping data for a stream being stopped");
                        continue;
                    }
                    if !open.contains_key(&stream_id) {
                        break Err(Error::Protocol(format!(
                            "stream {}: data before flag 1",
                            stream_id
                        )));
                    }
                    let content = block.content.unwrap_or_default();
                    if let Err(e) = handler.on_data(stream_id, content).await {
                        warn!(forward = %target, stream_id, "Local side failed to take data: {}", e);
                        self.abandon(&target, stream_id, &mut open, &mut stopping, handler.as_ref())
                            .await;
                    }
                }
                StreamFlag::Closed => {
                    if stopping.remove(&stream_id) {
                        continue;
                    }
                    let Some(done) = open.remove(&stream_id) else {
                        break Err(Error::Protocol(format!(
                            "stream {}: close before flag 1",
                            stream_id
                        )));
                    };
                    done.cancel();
                    handler.on_closed(stream_id).await;
                }
            }
        };

        for done in open.values() {
            done.cancel();
        }
        if result.is_err() {
            // the agent keeps these sockets until told otherwise
            for stream_id in open.into_keys() {
                let client = self.clone();
                let stopped = target.clone();
                self.inner
                    .tasks
                    .spawn(async move { client.stop(&stopped, stream_id).await });
                handler.on_closed(stream_id).await;
            }
        }
        match &result {
            Ok(()) => info!(forward = %target, "Reverse port forward ended"),
            Err(e) => error!(forward = %target, "Reverse port forward failed: {}", e),
        }
        result
    }

    /// Ask the agent to stop `stream_id` once `cancel` fires, unless the
    /// stream finished first.
    fn stop_on_cancel(
        &self,
        target: ForwardTarget,
        stream_id: StreamId,
        cancel: CancellationToken,
        done: CancellationToken,
    ) {
        let client = self.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => client.stop(&target, stream_id).await,
                _ = done.cancelled() => {}
                _ = client.inner.shutdown.cancelled() => {}
            }
        });
    }

    /// Tear one stream down after the local side failed it.
    async fn abandon(
        &self,
        target: &ForwardTarget,
        stream_id: StreamId,
        open: &mut HashMap<StreamId, CancellationToken>,
        stopping: &mut HashSet<StreamId>,
        handler: &dyn StreamHandler,
    ) {
        if let Some(done) = open.remove(&stream_id) {
            done.cancel();
        }
        stopping.insert(stream_id);

        let client = self.clone();
        let target = target.clone();
        self.inner
            .tasks
            .spawn(async move { client.stop(&target, stream_id).await });
        handler.on_closed(stream_id).await;
    }

    /// Open one stream to `service_dns:port` through the agent.
    ///
    /// Returns `None` when the agent could not connect. Otherwise the rest of
    /// the stream is delivered to `handler` in the background.
    pub async fn service_port_forward_start(
        &self,
        service_dns: &str,
        port: u16,
        handler: Arc<dyn StreamHandler>,
        cancel: CancellationToken,
    ) -> Result<Option<StreamId>> {
        let target = ForwardTarget::service(service_dns, port);
        let mut blocks = self
            .open_stream(Request::RunServicePortForward {
                service_dns: service_dns.to_string(),
                port,
            })
            .await?;

        let first = match blocks.recv().await {
            Some(Ok(block)) => block,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::Tunnel(format!(
                    "{} ended before reporting a stream",
                    target
                )))
            }
        };
        match first.flag {
            StreamFlag::Connected => {}
            StreamFlag::Closed => {
                debug!(forward = %target, "Agent could not connect");
                return Ok(None);
            }
            StreamFlag::Data => {
                return Err(Error::Protocol(format!(
                    "{}: expect flag 1 or 3, got {}",
                    target, first.flag
                )))
            }
        }

        let stream_id = first.stream_id;
        debug!(forward = %target, stream_id, "Service stream connected");
        let client = self.clone();
        self.inner.tasks.spawn(async move {
            client
                .read_service_stream(target, stream_id, blocks, handler, cancel)
                .await
        });
        Ok(Some(stream_id))
    }

    async fn read_service_stream(
        self,
        target: ForwardTarget,
        stream_id: StreamId,
        mut blocks: mpsc::Receiver<Result<StreamBlock>>,
        handler: Arc<dyn StreamHandler>,
        cancel: CancellationToken,
    ) {
        let stop_remote = loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break false,
                _ = cancel.cancelled() => break true,
                next = blocks.recv() => next,
            };
            let block = match next {
                Some(Ok(block)) => block,
                Some(Err(e)) => {
                    warn!(forward = %target, stream_id, "Service stream failed: {}", e);
                    break true;
                }
                None => break false,
            };
            if block.stream_id != stream_id {
                error!(forward = %target, "Block for stream {} on stream {}", block.stream_id, stream_id);
                break true;
            }
            match block.flag {
                StreamFlag::Data => {
                    let content = block.content.unwrap_or_default();
                    if let Err(e) = handler.on_data(stream_id, content).await {
                        warn!(forward = %target, stream_id, "Local side failed to take data: {}", e);
                        break true;
                    }
                }
                StreamFlag::Closed => {
                    handler.on_closed(stream_id).await;
                    return;
                }
                StreamFlag::Connected => {
                    error!(forward = %target, stream_id, "expect flag 2 or 3, got {}", block.flag);
                    break true;
                }
            }
        };

        // nobody drains the reply stream while Stop is in flight
        drop(blocks);
        if stop_remote {
            self.stop(&target, stream_id).await;
        }
        handler.on_closed(stream_id).await;
    }

    /// Write `content` to the agent-side socket of `stream_id`.
    ///
    /// Returns once the agent wrote the bytes. Fails when the agent has no
    /// forward for `target` or gave up on the stream; transport failures are
    /// logged and ignored.
    pub async fn send_data(&self, target: &ForwardTarget, stream_id: StreamId, content: Bytes) -> Result<()> {
        let request = match target {
            ForwardTarget::Reverse { port } => Request::SendReversePortForwardData {
                port: *port,
                stream_id,
            },
            ForwardTarget::Service(key) => Request::SendServicePortForwardData {
                service_dns: key.service_dns.clone(),
                port: key.port,
                stream_id,
            },
        };
        match self.call(request, content).await {
            Ok(Reply::Sent { accepted: true }) => Ok(()),
            Ok(Reply::Sent { accepted: false }) => Err(Error::Tunnel(format!(
                "agent has no port forward for {}",
                target
            ))),
            Ok(other) => Err(Error::Protocol(format!("unexpected reply to send: {:?}", other))),
            Err(e @ Error::Agent(_)) => Err(e),
            Err(e) => {
                warn!(forward = %target, stream_id, "Failed to send data: {}", e);
                Ok(())
            }
        }
    }

    pub async fn send_reverse_port_forward_data(&self, port: u16, stream_id: StreamId, content: Bytes) -> Result<()> {
        self.send_data(&ForwardTarget::Reverse { port }, stream_id, content).await
    }

    pub async fn send_service_port_forward_data(
        &self,
        service_dns: &str,
        port: u16,
        stream_id: StreamId,
        content: Bytes,
    ) -> Result<()> {
        self.send_data(&ForwardTarget::service(service_dns, port), stream_id, content)
            .await
    }

    /// Close one stream on the agent. Failures are only logged.
    pub async fn stop(&self, target: &ForwardTarget, stream_id: StreamId) {
        let request = match target {
            ForwardTarget::Reverse { port } => Request::StopReversePortForward {
                port: *port,
                stream_id,
            },
            ForwardTarget::Service(key) => Request::StopServicePortForward {
                service_dns: key.service_dns.clone(),
                port: key.port,
                stream_id,
            },
        };
        if let Err(e) = self.call(request, Bytes::new()).await {
            warn!(forward = %target, stream_id, "Failed to stop stream: {}", e);
        }
    }

    pub async fn stop_reverse_port_forward(&self, port: u16, stream_id: StreamId) {
        self.stop(&ForwardTarget::Reverse { port }, stream_id).await
    }

    pub async fn stop_service_port_forward(&self, service_dns: &str, port: u16, stream_id: StreamId) {
        self.stop(&ForwardTarget::service(service_dns, port), stream_id).await
    }

    /// Stop background work and close the control connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.connect_permit.close();
        self.inner.tasks.close();
        if tokio::time::timeout(SHUTDOWN_WAIT, self.inner.tasks.wait()).await.is_err() {
            warn!("Timed out waiting for tunnel tasks");
        }
        if let Some(connection) = self.inner.connection.swap(None) {
            if tokio::time::timeout(SHUTDOWN_WAIT, connection.close()).await.is_err() {
                warn!("Timed out closing the control connection");
            }
        }
        debug!("Tunnel client shut down");
    }
}
