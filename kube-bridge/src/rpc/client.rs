//! Client half of the control connection

use super::codec::{into_block, Frame, FrameCodec};
use crate::wire::{Envelope, Reply, Request, StreamBlock};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const OUTBOUND_QUEUE: usize = 256;

/// Blocks buffered per open reply stream; a reader further behind loses the call
const REPLY_STREAM_QUEUE: usize = 1000;

#[derive(Debug)]
enum Pending {
    Unary(oneshot::Sender<Result<Reply>>),
    Stream(mpsc::Sender<Result<StreamBlock>>),
}

/// One multiplexed control connection to the agent.
#[derive(Debug)]
pub struct RpcConnection {
    outbound: mpsc::Sender<Frame>,
    pending: Arc<DashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    tasks: TaskTracker,
}

impl RpcConnection {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (outbound, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let pending: Arc<DashMap<u64, Pending>> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let tasks = TaskTracker::new();

        let writer_closed = closed.clone();
        tasks.spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Control connection write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            writer_closed.cancel();
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_tasks = tasks.clone();
        tasks.spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    _ = reader_closed.cancelled() => break "connection closed".to_string(),
                    next = frames.next() => next,
                };
                match next {
                    Some(Ok(frame)) => {
                        if let Err(e) = dispatch(&reader_pending, frame, &reader_tasks, &reader_closed) {
                            break e.to_string();
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "agent closed the connection".to_string(),
                }
            };
            debug!("Control connection reader stopped: {}", reason);
            reader_closed.cancel();
            fail_pending(&reader_pending, &reason);
        });
        tasks.close();

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            tasks,
        }
    }

    /// Issue a unary request and wait for its reply.
    pub async fn call(&self, request: Request, payload: Bytes) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Unary(tx));
        self.submit(id, request, payload).await?;

        match rx.await {
            Ok(Ok(Reply::Failed { message })) => Err(Error::Agent(message)),
            Ok(reply) => reply,
            Err(_) => Err(Error::Tunnel("control connection closed".to_string())),
        }
    }

    /// Issue a streaming request; the receiver ends after `End` or an error.
    pub async fn open_stream(&self, request: Request) -> Result<mpsc::Receiver<Result<StreamBlock>>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(REPLY_STREAM_QUEUE);
        self.pending.insert(id, Pending::Stream(tx));
        self.submit(id, request, Bytes::new()).await?;
        Ok(rx)
    }

    async fn submit(&self, id: u64, request: Request, payload: Bytes) -> Result<()> {
        // the reader may have drained `pending` before the insert
        if self.closed.is_cancelled() {
            self.pending.remove(&id);
            return Err(Error::Tunnel("control connection closed".to_string()));
        }
        if self.outbound.send(Frame::request(id, request, payload)).await.is_err() {
            self.pending.remove(&id);
            return Err(Error::Tunnel("control connection closed".to_string()));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the connection and wait for its tasks to finish.
    pub async fn close(&self) {
        self.closed.cancel();
        self.tasks.wait().await;
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Route one reply to its caller without ever waiting on a slow one.
fn dispatch(
    pending: &DashMap<u64, Pending>,
    frame: Frame,
    tasks: &TaskTracker,
    closed: &CancellationToken,
) -> Result<()> {
    let Envelope::Reply { id, reply } = frame.envelope else {
        return Err(Error::Protocol(format!("unexpected request {} from agent", frame.id())));
    };

    match reply {
        Reply::Block { stream_id, flag } => {
            let tx = match pending.get(&id).as_deref() {
                Some(Pending::Stream(tx)) => tx.clone(),
                Some(Pending::Unary(_)) => {
                    return Err(Error::Protocol(format!("block reply for unary call {}", id)));
                }
                None => {
                    debug!(id, "Block for a stream nobody reads");
                    return Ok(());
                }
            };
            match tx.try_send(Ok(into_block(stream_id, flag, frame.payload))) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    pending.remove(&id);
                }
                Err(TrySendError::Full(_)) => {
                    warn!(id, "Reply stream reader fell behind, dropping the call");
                    pending.remove(&id);
                    fail_stream(tx, Error::Tunnel("reply stream reader fell behind".to_string()), tasks, closed);
                }
            }
        }
        Reply::End => {
            pending.remove(&id);
        }
        Reply::Failed { message } => match pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Ok(Reply::Failed { message }));
            }
            Some((_, Pending::Stream(tx))) => fail_stream(tx, Error::Agent(message), tasks, closed),
            None => warn!(id, "Failure for an unknown call: {}", message),
        },
        reply => match pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Ok(reply));
            }
            Some((_, Pending::Stream(_))) => {
                return Err(Error::Protocol(format!("unary reply for stream call {}", id)));
            }
            None => debug!(id, "Reply for an unknown call"),
        },
    }
    Ok(())
}

/// Queue `error` behind the blocks already buffered for a stream call.
fn fail_stream(
    tx: mpsc::Sender<Result<StreamBlock>>,
    error: Error,
    tasks: &TaskTracker,
    closed: &CancellationToken,
) {
    if let Err(TrySendError::Full(error)) = tx.try_send(Err(error)) {
        let closed = closed.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tx.send(error) => {}
            }
        });
    }
}

fn fail_pending(pending: &DashMap<u64, Pending>, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        match pending.remove(&id) {
            Some((_, Pending::Unary(tx))) => {
                let _ = tx.send(Err(Error::Tunnel(reason.to_string())));
            }
            Some((_, Pending::Stream(tx))) => {
                let _ = tx.try_send(Err(Error::Tunnel(reason.to_string())));
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::server::serve_connection;
    use crate::tunnel::TunnelControlEndpoint;
    use crate::wire::StreamFlag;
    use std::time::Duration;

    fn pair() -> (RpcConnection, Arc<TunnelControlEndpoint>, CancellationToken) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let endpoint = Arc::new(TunnelControlEndpoint::new(16, Duration::from_secs(5)));
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_connection(server_io, endpoint.clone(), shutdown.clone()));
        (RpcConnection::from_stream(client_io), endpoint, shutdown)
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let (conn, _endpoint, _shutdown) = pair();
        assert_eq!(conn.call(Request::Ping, Bytes::new()).await.unwrap(), Reply::Ack);
        assert_eq!(conn.call(Request::Reset, Bytes::new()).await.unwrap(), Reply::Ack);
    }

    #[tokio::test]
    async fn send_to_unknown_target_is_rejected_not_failed() {
        let (conn, _endpoint, _shutdown) = pair();
        let reply = conn
            .call(
                Request::SendReversePortForwardData { port: 9, stream_id: 1 },
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::Sent { accepted: false });
    }

    #[tokio::test]
    async fn unreachable_service_stream_reports_closed() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (conn, _endpoint, _shutdown) = pair();

        let mut blocks = conn
            .open_stream(Request::RunServicePortForward {
                service_dns: "127.0.0.1".into(),
                port,
            })
            .await
            .unwrap();
        let block = blocks.recv().await.unwrap().unwrap();
        assert_eq!(block.flag, StreamFlag::Closed);
        // End closes the reply stream
        assert!(blocks.recv().await.is_none());
    }

    #[tokio::test]
    async fn server_shutdown_fails_pending_calls() {
        let (conn, _endpoint, shutdown) = pair();
        conn.call(Request::Ping, Bytes::new()).await.unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), conn.closed.cancelled())
            .await
            .unwrap();
        assert!(conn.is_closed());
        assert!(conn.call(Request::Ping, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn lagging_stream_reader_loses_only_its_call() {
        let pending = DashMap::new();
        let tasks = TaskTracker::new();
        let closed = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        pending.insert(7, Pending::Stream(tx));
        let (unary_tx, unary_rx) = oneshot::channel();
        pending.insert(8, Pending::Unary(unary_tx));

        dispatch(&pending, Frame::block(7, StreamBlock::connected(1)), &tasks, &closed).unwrap();
        // the reader has not taken the first block yet
        dispatch(
            &pending,
            Frame::block(7, StreamBlock::data(1, Bytes::from_static(b"x"))),
            &tasks,
            &closed,
        )
        .unwrap();
        assert!(!pending.contains_key(&7));

        dispatch(&pending, Frame::reply(8, Reply::Ack), &tasks, &closed).unwrap();
        assert_eq!(unary_rx.await.unwrap().unwrap(), Reply::Ack);

        assert_eq!(rx.recv().await.unwrap().unwrap().flag, StreamFlag::Connected);
        assert!(matches!(rx.recv().await.unwrap(), Err(Error::Tunnel(_))));
        assert!(rx.recv().await.is_none());
    }
}
