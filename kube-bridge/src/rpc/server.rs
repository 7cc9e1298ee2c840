//! Serves one control connection against a [`TunnelControlEndpoint`]

use super::codec::{Frame, FrameCodec};
use crate::tunnel::{ForwardTarget, TunnelControlEndpoint, WriteReceipt};
use crate::wire::{Envelope, Reply, Request, StreamBlock};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Frames queued for the connection writer
const OUTBOUND_QUEUE: usize = 256;

/// Serve requests until the peer disconnects or `shutdown` fires.
///
/// The read loop never waits on a single stream: `Send*` is queued on its
/// socket and confirmed from a separate task once written. Forwarding
/// targets opened through this connection are released when it ends.
pub async fn serve_connection<S>(
    stream: S,
    endpoint: Arc<TunnelControlEndpoint>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let connection = shutdown.child_token();
    let tasks = TaskTracker::new();

    let writer_cancel = connection.clone();
    tasks.spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!("Control connection write failed: {}", e);
                break;
            }
        }
        writer_cancel.cancel();
    });

    let mut opened: HashSet<ForwardTarget> = HashSet::new();
    let result = loop {
        let next = tokio::select! {
            _ = connection.cancelled() => break Ok(()),
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        let (id, request) = match frame.envelope {
            Envelope::Request { id, request } => (id, request),
            Envelope::Reply { id, .. } => {
                break Err(Error::Protocol(format!("unexpected reply {} from client", id)));
            }
        };

        let streaming_target = match &request {
            Request::RunReversePortForward(info) => Some(ForwardTarget::Reverse { port: info.port }),
            Request::RunServicePortForward { service_dns, port } => {
                Some(ForwardTarget::service(service_dns.clone(), *port))
            }
            _ => None,
        };
        if let Some(target) = streaming_target {
            opened.insert(target);
            tasks.spawn(forward_blocks(
                id,
                request,
                endpoint.clone(),
                out_tx.clone(),
                connection.clone(),
            ));
            continue;
        }

        let queued = match request {
            Request::SendReversePortForwardData { port, stream_id } => {
                endpoint.send_reverse_port_forward_data(port, stream_id, frame.payload)
            }
            Request::SendServicePortForwardData {
                service_dns,
                port,
                stream_id,
            } => endpoint.send_service_port_forward_data(&service_dns, port, stream_id, frame.payload),
            request => {
                let reply = handle_unary(&endpoint, request).await;
                if out_tx.send(Frame::reply(id, reply)).await.is_err() {
                    break Ok(());
                }
                continue;
            }
        };
        let reply = match queued {
            Ok(Some(receipt)) => {
                tasks.spawn(confirm_write(id, receipt, out_tx.clone(), connection.clone()));
                continue;
            }
            Ok(None) => Reply::Sent { accepted: false },
            Err(e) => Reply::Failed {
                message: e.to_string(),
            },
        };
        if out_tx.send(Frame::reply(id, reply)).await.is_err() {
            break Ok(());
        }
    };

    if let Err(e) = &result {
        warn!("Control connection failed: {}", e);
    }
    connection.cancel();
    drop(out_tx);
    for target in &opened {
        endpoint.release(target).await;
    }
    tasks.close();
    tasks.wait().await;
    info!("Control connection closed, released {} port forwards", opened.len());
    result
}

async fn handle_unary(endpoint: &TunnelControlEndpoint, request: Request) -> Reply {
    let result = match request {
        Request::Ping => {
            endpoint.ping();
            Ok(Reply::Ack)
        }
        Request::Reset => {
            endpoint.reset().await;
            Ok(Reply::Ack)
        }
        Request::StopReversePortForward { port, stream_id } => {
            endpoint.stop_reverse_port_forward(port, stream_id);
            Ok(Reply::Ack)
        }
        Request::StopServicePortForward {
            service_dns,
            port,
            stream_id,
        } => {
            endpoint.stop_service_port_forward(&service_dns, port, stream_id);
            Ok(Reply::Ack)
        }
        Request::SendReversePortForwardData { .. } | Request::SendServicePortForwardData { .. } => Err(
            Error::Protocol("send request handled as unary".to_string()),
        ),
        Request::RunReversePortForward(_) | Request::RunServicePortForward { .. } => Err(
            Error::Protocol("streaming request handled as unary".to_string()),
        ),
    };
    result.unwrap_or_else(|e| Reply::Failed {
        message: e.to_string(),
    })
}

/// Reply to one `Send*` once its bytes reached the socket.
async fn confirm_write(id: u64, receipt: WriteReceipt, out_tx: mpsc::Sender<Frame>, cancel: CancellationToken) {
    let reply = tokio::select! {
        _ = cancel.cancelled() => return,
        written = receipt.written() => match written {
            Ok(()) => Reply::Sent { accepted: true },
            Err(e) => Reply::Failed { message: e.to_string() },
        },
    };
    let _ = out_tx.send(Frame::reply(id, reply)).await;
}

/// Relay the block queue of one `Run*` call until it ends.
async fn forward_blocks(
    id: u64,
    request: Request,
    endpoint: Arc<TunnelControlEndpoint>,
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let opened = match request {
        Request::RunReversePortForward(info) => endpoint.run_reverse_port_forward(info).await,
        Request::RunServicePortForward { service_dns, port } => {
            endpoint.run_service_port_forward(&service_dns, port).await
        }
        _ => Err(Error::Protocol("unary request handled as streaming".to_string())),
    };
    let mut blocks = match opened {
        Ok(blocks) => blocks,
        Err(e) => {
            let _ = out_tx
                .send(Frame::reply(id, Reply::Failed { message: e.to_string() }))
                .await;
            return;
        }
    };

    loop {
        let block: StreamBlock = tokio::select! {
            _ = cancel.cancelled() => return,
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };
        if out_tx.send(Frame::block(id, block)).await.is_err() {
            return;
        }
    }
    let _ = out_tx.send(Frame::reply(id, Reply::End)).await;
}
