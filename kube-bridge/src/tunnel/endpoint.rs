//! In-cluster side of the tunnel
//!
//! Every `Run*` call fetches or creates the connector for its target and gets
//! back the receiving half of a bounded block queue. `Send*` and `Stop*` look
//! the connector up by key and act on one stream only; neither ever waits on
//! a socket.

use super::{
    BlockSink, ConnectorRegistry, ForwardTarget, ReverseConnector, ServiceConnector, ServiceKey,
    StreamConnector, WriteReceipt, DEFAULT_QUEUE_CAPACITY,
};
use crate::config::AgentConfig;
use crate::wire::{PortForwardStartInfo, StreamBlock};
use crate::{Result, StreamId};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct TunnelControlEndpoint {
    reverse: ConnectorRegistry<u16, ReverseConnector>,
    service: ConnectorRegistry<ServiceKey, ServiceConnector>,
    queue_capacity: usize,
    connect_timeout: Duration,
    listen_address: IpAddr,
}

impl Default for TunnelControlEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, Duration::from_secs(10))
    }
}

impl TunnelControlEndpoint {
    pub fn new(queue_capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            reverse: ConnectorRegistry::new(),
            service: ConnectorRegistry::new(),
            queue_capacity,
            connect_timeout,
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.queue_capacity, config.connect_timeout())
    }

    /// Address reverse connectors listen on.
    pub fn with_listen_address(mut self, listen_address: IpAddr) -> Self {
        self.listen_address = listen_address;
        self
    }

    pub fn ping(&self) {
        debug!("Ping");
    }

    /// Stop and forget every connector of every target.
    pub async fn reset(&self) {
        info!(
            reverse = self.reverse.len(),
            service = self.service.len(),
            "Resetting all port forwards"
        );
        self.reverse.clear().await;
        self.service.clear().await;
    }

    pub async fn run_reverse_port_forward(
        &self,
        info: PortForwardStartInfo,
    ) -> Result<mpsc::Receiver<StreamBlock>> {
        let listen_address = self.listen_address;
        let connector = self.reverse.get_or_create(info.port, || {
            ReverseConnector::new(listen_address, info.port, info.http_probes.clone())
        });
        connector.set_http_probes(info.http_probes);

        let (sink, rx) = BlockSink::channel(self.queue_capacity);
        connector.connect(sink).await?;
        Ok(rx)
    }

    /// Returns `None` when no connector exists for `port`.
    pub fn send_reverse_port_forward_data(
        &self,
        port: u16,
        stream_id: StreamId,
        content: Bytes,
    ) -> Result<Option<WriteReceipt>> {
        self.reverse
            .get(&port)
            .map(|connector| connector.send(stream_id, content))
            .transpose()
    }

    pub fn stop_reverse_port_forward(&self, port: u16, stream_id: StreamId) {
        if let Some(connector) = self.reverse.get(&port) {
            connector.disconnect(stream_id);
        }
    }

    pub async fn run_service_port_forward(
        &self,
        service_dns: &str,
        port: u16,
    ) -> Result<mpsc::Receiver<StreamBlock>> {
        let key = ServiceKey::new(service_dns, port);
        let connect_timeout = self.connect_timeout;
        let connector = self
            .service
            .get_or_create(key.clone(), || ServiceConnector::new(key, connect_timeout));

        let (sink, rx) = BlockSink::channel(self.queue_capacity);
        connector.connect(sink).await?;
        Ok(rx)
    }

    /// Returns `None` when no connector exists for the service.
    pub fn send_service_port_forward_data(
        &self,
        service_dns: &str,
        port: u16,
        stream_id: StreamId,
        content: Bytes,
    ) -> Result<Option<WriteReceipt>> {
        self.service
            .get(&ServiceKey::new(service_dns, port))
            .map(|connector| connector.send(stream_id, content))
            .transpose()
    }

    pub fn stop_service_port_forward(&self, service_dns: &str, port: u16, stream_id: StreamId) {
        if let Some(connector) = self.service.get(&ServiceKey::new(service_dns, port)) {
            connector.disconnect(stream_id);
        }
    }

    /// Stop and unregister the connector of `target`.
    pub async fn release(&self, target: &ForwardTarget) {
        let removed = match target {
            ForwardTarget::Reverse { port } => self.reverse.remove(port).await,
            ForwardTarget::Service(key) => self.service.remove(key).await,
        };
        if removed {
            debug!(forward = %target, "Released port forward");
        }
    }

    pub fn connector_count(&self) -> usize {
        self.reverse.len() + self.service.len()
    }

    pub(crate) fn reverse_connector(&self, port: u16) -> Option<Arc<ReverseConnector>> {
        self.reverse.get(&port)
    }
}
