//! Socket owners for forwarding targets
//!
//! A connector owns every real socket of one [`ForwardTarget`]. Each socket
//! gets a fresh [`StreamId`] and a pump task that turns socket events into
//! [`StreamBlock`]s and writes client bytes back to the socket. A stream emits
//! `Connected` once, any number of `Data`, and `Closed` exactly once when the
//! pump exits; after that the id is gone for good.

use super::probe::{ProbeFilter, PROBE_RESPONSE};
use super::{ForwardTarget, ServiceKey, READ_CHUNK_SIZE, SOCKET_WRITE_QUEUE};
use crate::wire::StreamBlock;
use crate::{Error, Result, StreamId};
use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Output queue of one forwarding call.
///
/// Producers wait when the queue is full; blocks are never dropped.
#[derive(Debug, Clone)]
pub struct BlockSink {
    tx: mpsc::Sender<StreamBlock>,
}

impl BlockSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamBlock>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false once nobody reads the queue any more.
    pub async fn on_connected(&self, stream_id: StreamId) -> bool {
        self.tx.send(StreamBlock::connected(stream_id)).await.is_ok()
    }

    pub async fn on_data(&self, stream_id: StreamId, content: Bytes) -> bool {
        self.tx.send(StreamBlock::data(stream_id, content)).await.is_ok()
    }

    pub async fn on_closed(&self, stream_id: StreamId) -> bool {
        self.tx.send(StreamBlock::closed(stream_id)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the sockets of one forwarding target.
pub trait StreamConnector: Send + Sync + std::fmt::Debug {
    fn target(&self) -> ForwardTarget;

    /// Start producing streams into `sink`.
    fn connect(&self, sink: BlockSink) -> BoxFuture<'_, Result<()>>;

    /// Queue client bytes for the socket behind `stream_id`.
    ///
    /// Never waits: a socket whose queue is full has stopped draining, so the
    /// stream is closed and an error returned.
    fn send(&self, stream_id: StreamId, content: Bytes) -> Result<WriteReceipt>;

    /// Close one stream; other streams of this target stay open.
    fn disconnect(&self, stream_id: StreamId);

    /// Close every stream and wait for all of the connector's tasks.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Resolves once the bytes of one [`StreamConnector::send`] reached the socket.
#[derive(Debug)]
pub struct WriteReceipt {
    stream_id: StreamId,
    written: oneshot::Receiver<()>,
}

impl WriteReceipt {
    pub async fn written(self) -> Result<()> {
        self.written.await.map_err(|_| {
            Error::Tunnel(format!("stream {} closed before the data was written", self.stream_id))
        })
    }
}

#[derive(Debug)]
struct PendingWrite {
    content: Bytes,
    written: oneshot::Sender<()>,
}

#[derive(Debug)]
struct StreamHandle {
    write_tx: mpsc::Sender<PendingWrite>,
    cancel: CancellationToken,
}

/// Open streams of one connector and the tasks pumping them.
#[derive(Debug, Clone)]
struct Streams {
    open: Arc<DashMap<StreamId, StreamHandle>>,
    next_id: Arc<AtomicI32>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Streams {
    fn new() -> Self {
        Self {
            open: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicI32::new(1)),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn next_id(&self) -> StreamId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `stream_id` writable before anyone learns it exists.
    fn register(&self, stream_id: StreamId) -> (mpsc::Receiver<PendingWrite>, CancellationToken) {
        let (write_tx, write_rx) = mpsc::channel(SOCKET_WRITE_QUEUE);
        let cancel = self.shutdown.child_token();
        self.open.insert(
            stream_id,
            StreamHandle {
                write_tx,
                cancel: cancel.clone(),
            },
        );
        (write_rx, cancel)
    }

    fn send(&self, stream_id: StreamId, content: Bytes) -> Result<WriteReceipt> {
        let handle = self
            .open
            .get(&stream_id)
            .ok_or_else(|| Error::Protocol(format!("stream {} is not open", stream_id)))?;
        let (written, receipt) = oneshot::channel();
        match handle.write_tx.try_send(PendingWrite { content, written }) {
            Ok(()) => Ok(WriteReceipt {
                stream_id,
                written: receipt,
            }),
            Err(TrySendError::Full(_)) => {
                warn!(stream_id, "Socket stopped draining, closing the stream");
                handle.cancel.cancel();
                Err(Error::Tunnel(format!("stream {} write queue is full", stream_id)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::Tunnel(format!("stream {} closed while sending", stream_id)))
            }
        }
    }

    fn disconnect(&self, stream_id: StreamId) {
        match self.open.get(&stream_id) {
            Some(handle) => handle.cancel.cancel(),
            None => debug!(stream_id, "Stop for a stream that is not open"),
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Shuttle bytes between `socket` and the tunnel until either side closes.
    ///
    /// Every wait is raced against `cancel` so `Stop` and `Reset` finish even
    /// when the peer stopped reading.
    async fn pump(
        self,
        stream_id: StreamId,
        socket: TcpStream,
        sink: BlockSink,
        mut write_rx: mpsc::Receiver<PendingWrite>,
        cancel: CancellationToken,
        mut probes: ProbeFilter,
    ) {
        let (mut reader, mut writer) = socket.into_split();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(stream_id, "Stream stopped");
                    break;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(stream_id, "Socket reached EOF");
                        if let Some(held) = probes.finish() {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = sink.on_data(stream_id, held) => {}
                            }
                        }
                        break;
                    }
                    Ok(n) => {
                        let filtered = probes.feed(&buf[..n]);
                        let mut answered = true;
                        for _ in 0..filtered.answered {
                            debug!(stream_id, "Answering HTTP probe locally");
                            answered = tokio::select! {
                                _ = cancel.cancelled() => false,
                                written = writer.write_all(PROBE_RESPONSE) => written.is_ok(),
                            };
                            if !answered {
                                break;
                            }
                        }
                        if !answered {
                            break;
                        }
                        let Some(content) = filtered.forward else { continue };
                        let delivered = tokio::select! {
                            _ = cancel.cancelled() => false,
                            delivered = sink.on_data(stream_id, content) => delivered,
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(stream_id, "Socket read failed: {}", e);
                        break;
                    }
                },
                pending = write_rx.recv() => match pending {
                    Some(PendingWrite { content, written }) => {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => None,
                            result = writer.write_all(&content) => Some(result),
                        };
                        match result {
                            Some(Ok(())) => {
                                let _ = written.send(());
                            }
                            Some(Err(e)) => {
                                debug!(stream_id, "Socket write failed: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                    None => break,
                },
            }
        }

        self.open.remove(&stream_id);
        let _ = writer.shutdown().await;
        sink.on_closed(stream_id).await;
    }
}

/// Listens on a pod port and surfaces every accepted connection as a stream.
#[derive(Debug)]
pub struct ReverseConnector {
    listen_address: IpAddr,
    port: u16,
    http_probes: Arc<ArcSwap<Vec<String>>>,
    sink: Arc<ArcSwapOption<BlockSink>>,
    listening: Mutex<bool>,
    streams: Streams,
}

impl ReverseConnector {
    pub fn new(listen_address: IpAddr, port: u16, http_probes: Vec<String>) -> Self {
        Self {
            listen_address,
            port,
            http_probes: Arc::new(ArcSwap::from_pointee(http_probes)),
            sink: Arc::new(ArcSwapOption::empty()),
            listening: Mutex::new(false),
            streams: Streams::new(),
        }
    }

    /// Replace the probe paths answered locally for new data.
    pub fn set_http_probes(&self, http_probes: Vec<String>) {
        self.http_probes.store(Arc::new(http_probes));
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open.len()
    }

    async fn listen(&self) -> Result<()> {
        let mut listening = self.listening.lock().await;
        if *listening {
            return Ok(());
        }
        let addr = SocketAddr::new(self.listen_address, self.port);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::Tunnel(format!("cannot listen on {} for reverse port forward: {}", addr, e))
        })?;
        info!("Reverse port forward listening on {}", addr);
        *listening = true;

        let streams = self.streams.clone();
        let sink = self.sink.clone();
        let http_probes = self.http_probes.clone();
        self.streams
            .tasks
            .spawn(accept_loop(listener, streams, sink, http_probes));
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    streams: Streams,
    sink: Arc<ArcSwapOption<BlockSink>>,
    http_probes: Arc<ArcSwap<Vec<String>>>,
) {
    loop {
        let accepted = tokio::select! {
            _ = streams.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept reverse connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some(current) = sink.load_full() else {
            debug!("No client attached, refusing connection from {}", peer);
            continue;
        };
        let current = BlockSink::clone(&current);
        let stream_id = streams.next_id();
        let (write_rx, cancel) = streams.register(stream_id);
        if !current.on_connected(stream_id).await {
            streams.open.remove(&stream_id);
            continue;
        }
        debug!(stream_id, "Accepted connection from {}", peer);
        let _ = socket.set_nodelay(true);
        streams.tasks.spawn(streams.clone().pump(
            stream_id,
            socket,
            current,
            write_rx,
            cancel,
            ProbeFilter::new(http_probes.load_full()),
        ));
    }
}

impl StreamConnector for ReverseConnector {
    fn target(&self) -> ForwardTarget {
        ForwardTarget::Reverse { port: self.port }
    }

    fn connect(&self, sink: BlockSink) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.streams.shutdown.is_cancelled() {
                return Err(Error::Tunnel(format!("reverse port forward on {} was stopped", self.port)));
            }
            self.sink.store(Some(Arc::new(sink)));
            self.listen().await
        })
    }

    fn send(&self, stream_id: StreamId, content: Bytes) -> Result<WriteReceipt> {
        self.streams.send(stream_id, content)
    }

    fn disconnect(&self, stream_id: StreamId) {
        self.streams.disconnect(stream_id);
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.sink.store(None);
            self.streams.stop().await;
            info!("Reverse port forward on {} stopped", self.port);
        })
    }
}

/// Dials a cluster service once per `connect`, one stream per dial.
#[derive(Debug)]
pub struct ServiceConnector {
    key: ServiceKey,
    connect_timeout: Duration,
    streams: Streams,
}

impl ServiceConnector {
    pub fn new(key: ServiceKey, connect_timeout: Duration) -> Self {
        Self {
            key,
            connect_timeout,
            streams: Streams::new(),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open.len()
    }
}

impl StreamConnector for ServiceConnector {
    fn target(&self) -> ForwardTarget {
        ForwardTarget::Service(self.key.clone())
    }

    fn connect(&self, sink: BlockSink) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.streams.shutdown.is_cancelled() {
                return Err(Error::Tunnel(format!("service port forward to {} was stopped", self.key)));
            }
            let streams = self.streams.clone();
            let key = self.key.clone();
            let connect_timeout = self.connect_timeout;
            let stream_id = streams.next_id();

            self.streams.tasks.spawn(async move {
                let dial = tokio::time::timeout(
                    connect_timeout,
                    TcpStream::connect((key.service_dns.as_str(), key.port)),
                );
                let socket = tokio::select! {
                    _ = streams.shutdown.cancelled() => None,
                    dialed = dial => match dialed {
                        Ok(Ok(socket)) => Some(socket),
                        Ok(Err(e)) => {
                            warn!(stream_id, "Failed to connect to {}: {}", key, e);
                            None
                        }
                        Err(_) => {
                            warn!(stream_id, "Timed out connecting to {}", key);
                            None
                        }
                    },
                };
                let Some(socket) = socket else {
                    sink.on_closed(stream_id).await;
                    return;
                };

                let _ = socket.set_nodelay(true);
                let (write_rx, cancel) = streams.register(stream_id);
                if !sink.on_connected(stream_id).await {
                    streams.open.remove(&stream_id);
                    return;
                }
                debug!(stream_id, "Connected to {}", key);
                streams
                    .clone()
                    .pump(stream_id, socket, sink, write_rx, cancel, ProbeFilter::disabled())
                    .await;
            });
            Ok(())
        })
    }

    fn send(&self, stream_id: StreamId, content: Bytes) -> Result<WriteReceipt> {
        self.streams.send(stream_id, content)
    }

    fn disconnect(&self, stream_id: StreamId) {
        self.streams.disconnect(stream_id);
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.streams.stop().await;
            debug!("Service port forward to {} stopped", self.key);
        })
    }
}
