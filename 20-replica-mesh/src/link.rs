//! Outbound links to other replicas.
//!
//! Each [`PeerLink`] owns one background task that connects to the peer,
//! writes queued envelopes, and reconnects when the connection drops. Frames
//! pushed while the link is down wait in the link's outbox and go out once
//! the connection is back.
//!
//! Reconnection is bounded: after `max_attempts` consecutive failures the
//! task exits and the link stays inactive until the connection manager is
//! asked to connect again.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::identity::PeerIdentity;
use crate::wire::{Envelope, EnvelopeCodec};

/// Connection state shared between a link's task and its owner.
#[derive(Debug)]
pub struct LinkStatus {
    active: AtomicBool,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
}

impl LinkStatus {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            // A fresh link starts in its first connect cycle.
            reconnecting: AtomicBool::new(true),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while a connect cycle is running. Only one runs per link.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Connect attempts made in the current (or last) reconnect cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Owner's side of one outbound link.
///
/// Dropping it aborts the link task, which closes the socket.
pub struct PeerLink {
    outbox: mpsc::UnboundedSender<Envelope>,
    status: Arc<LinkStatus>,
    task: JoinHandle<()>,
}

impl PeerLink {
    /// Starts connecting to `peer` in the background.
    pub fn spawn(peer: PeerIdentity, policy: ReconnectPolicy) -> Self {
        let (outbox, rx) = mpsc::unbounded_channel();
        let status = Arc::new(LinkStatus::new());
        let task = tokio::spawn(drive(peer, policy, Arc::clone(&status), rx));
        Self {
            outbox,
            status,
            task,
        }
    }

    /// Queues a frame. Returns `false` if the link has given up.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbox.send(envelope).is_ok()
    }

    /// Shared status, readable after the link itself is gone.
    pub fn status(&self) -> Arc<LinkStatus> {
        Arc::clone(&self.status)
    }

    /// True while connected. Frames sent while inactive wait in the outbox.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// True once the reconnect budget ran out and the link task has exited.
    pub fn is_exhausted(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        // Aborting drops the socket, which is how a blocked write is unstuck.
        self.task.abort();
    }
}

enum LinkEnd {
    /// The owner dropped the link.
    Closed,
    Lost(io::Error),
}

async fn drive(
    peer: PeerIdentity,
    policy: ReconnectPolicy,
    status: Arc<LinkStatus>,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        let Some(stream) = connect_with_retry(&peer, &policy, &status).await else {
            warn!(
                peer = peer.id,
                attempts = status.attempts(),
                "giving up on link until the next connect request"
            );
            return;
        };

        status.active.store(true, Ordering::SeqCst);
        info!(peer = %peer, "link established");
        let end = pump(stream, &mut outbox).await;
        status.active.store(false, Ordering::SeqCst);

        match end {
            LinkEnd::Closed => {
                debug!(peer = peer.id, "link closed");
                return;
            }
            LinkEnd::Lost(err) => {
                warn!(peer = peer.id, error = %err, "link lost, reconnecting");
            }
        }
    }
}

async fn connect_with_retry(
    peer: &PeerIdentity,
    policy: &ReconnectPolicy,
    status: &LinkStatus,
) -> Option<TcpStream> {
    status.reconnecting.store(true, Ordering::SeqCst);
    status.attempts.store(0, Ordering::SeqCst);
    let addr = peer.addr();

    let mut connected = None;
    while status.attempts() < policy.max_attempts {
        let attempt = status.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match tokio::time::timeout(policy.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                connected = Some(stream);
                break;
            }
            Ok(Err(err)) => debug!(peer = peer.id, attempt, error = %err, "connect failed"),
            Err(_) => debug!(peer = peer.id, attempt, "connect timed out"),
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    status.reconnecting.store(false, Ordering::SeqCst);
    if let Some(stream) = &connected {
        let _ = stream.set_nodelay(true);
    }
    connected
}

/// Writes queued frames until the owner goes away or the connection breaks.
///
/// Replicas never answer on an outbound link, so the read half only exists
/// to notice the peer closing the socket while we are idle.
async fn pump(stream: TcpStream, outbox: &mut mpsc::UnboundedReceiver<Envelope>) -> LinkEnd {
    let (mut reader, writer) = stream.into_split();
    let mut sink = FramedWrite::new(writer, EnvelopeCodec);
    let mut scratch = [0u8; 64];

    loop {
        select! {
            next = outbox.recv() => match next {
                Some(envelope) => {
                    if let Err(err) = sink.send(envelope).await {
                        return LinkEnd::Lost(err);
                    }
                }
                None => return LinkEnd::Closed,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    return LinkEnd::Lost(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(_) => {}
                Err(err) => return LinkEnd::Lost(err),
            },
        }
    }
}
