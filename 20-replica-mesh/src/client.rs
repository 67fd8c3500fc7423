//! Client-facing side of a replica.
//!
//! Mirrors the replica path: a listener feeds decoded requests into the
//! client input queue, the client dispatch loop answers with
//! [`ClientOperation`]s, and [`ClientSender`] routes those back to the right
//! connection. Client frames use the legacy sized framing and are unsigned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::message::{ClientId, ClientReply, ClientRequest};
use crate::operation::ClientOperation;
use crate::queue::{QueueReceiver, QueueSender, drain};
use crate::shutdown::Liveness;
use crate::wire::SizedCodec;

/// A decoded request tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct ClientEnvelope {
    pub client: ClientId,
    pub request: ClientRequest,
}

/// Write channels of the currently connected clients.
#[derive(Clone, Default)]
pub struct ClientDirectory {
    inner: Arc<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<Bytes>>>,
    next_id: AtomicU64,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, writer: mpsc::UnboundedSender<Bytes>) -> ClientId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients().insert(id, writer);
        id
    }

    fn remove(&self, id: ClientId) {
        self.clients().remove(&id);
    }

    /// Queues an encoded reply. Returns `false` if the client is gone.
    pub fn send(&self, id: ClientId, frame: Bytes) -> bool {
        self.clients()
            .get(&id)
            .is_some_and(|writer| writer.send(frame).is_ok())
    }

    /// Number of currently connected clients.
    pub fn connected(&self) -> usize {
        self.clients().len()
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, mpsc::UnboundedSender<Bytes>>> {
        self.inner.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts client connections until shutdown.
pub async fn run_client_listener(
    listener: TcpListener,
    directory: ClientDirectory,
    input: QueueSender<ClientEnvelope>,
    liveness: Liveness,
) {
    loop {
        select! {
            _ = liveness.stopped() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(serve_client(
                        stream,
                        addr,
                        directory.clone(),
                        input.clone(),
                        liveness.clone(),
                    ));
                }
                Err(err) => warn!(error = ?err, "failed to accept client connection"),
            }
        }
    }
    debug!("client listener stopped");
}

async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    directory: ClientDirectory,
    input: QueueSender<ClientEnvelope>,
    liveness: Liveness,
) {
    let (reader, writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
    let client = directory.register(reply_tx);
    info!(client, %addr, connected = directory.connected(), "client connected");

    let writer_task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, SizedCodec);
        while let Some(frame) = reply_rx.recv().await {
            if let Err(err) = sink.send(frame).await {
                debug!(client, error = %err, "failed to write client reply");
                break;
            }
        }
    });

    let mut frames = FramedRead::new(reader, SizedCodec);
    loop {
        let frame = select! {
            _ = liveness.stopped() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(payload)) => match ClientRequest::decode(&payload) {
                Ok(request) => {
                    if !input.push(ClientEnvelope { client, request }) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(client, error = %err, "malformed client request");
                    let reply = ClientReply::Error {
                        message: format!("malformed request: {err}"),
                    };
                    if let Ok(encoded) = reply.encode() {
                        directory.send(client, encoded.into());
                    }
                }
            },
            Some(Err(err)) => {
                warn!(client, error = %err, "closing client after framing error");
                break;
            }
            None => break,
        }
    }

    directory.remove(client);
    // Replies already queued are flushed before the writer sees the channel close.
    let _ = writer_task.await;
    info!(client, %addr, connected = directory.connected(), "client disconnected");
}

/// Drains the client output queue.
pub struct ClientSender {
    directory: ClientDirectory,
}

impl ClientSender {
    pub fn new(directory: ClientDirectory) -> Self {
        Self { directory }
    }

    pub async fn run(
        self,
        operations: QueueReceiver<ClientOperation>,
        liveness: Liveness,
        poll_interval: Duration,
    ) {
        drain("client-sender", operations, liveness, poll_interval, |operation| {
            self.execute(operation)
        })
        .await;
    }

    pub fn execute(&self, operation: ClientOperation) {
        match operation {
            ClientOperation::Respond { client, reply } => {
                let encoded = match reply.encode() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        warn!(client, error = %err, "failed to encode client reply");
                        return;
                    }
                };
                if !self.directory.send(client, encoded.into()) {
                    warn!(client, "client is gone, dropping reply");
                }
            }
        }
    }
}
