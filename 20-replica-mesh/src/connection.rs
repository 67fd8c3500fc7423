//! Replica-to-replica networking.
//!
//! - [`ConnectionManager`] drains the output queue and turns each
//!   [`Operation`] into writes on per-peer [`PeerLink`]s.
//! - [`run_listener`] accepts inbound connections and runs one reader task
//!   per connection, which verifies frames and pushes them to the input queue
//!   in arrival order.
//!
//! Failures stay here: a bad frame, an unknown target, or a dead peer is
//! logged and never reaches the dispatch loop as an error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::identity::{PeerId, PeerIdentity};
use crate::link::PeerLink;
use crate::message::{SignedMessage, Verifier};
use crate::operation::Operation;
use crate::queue::{QueueReceiver, QueueSender, drain};
use crate::shutdown::Liveness;
use crate::view::SharedView;
use crate::wire::{Envelope, EnvelopeCodec};

/// Owns every outbound link of one replica; at most one per peer.
pub struct ConnectionManager {
    local: PeerIdentity,
    view: SharedView,
    policy: ReconnectPolicy,
    links: HashMap<PeerId, PeerLink>,
}

impl ConnectionManager {
    /// Creates a manager with no links. `view` is read to resolve unicast
    /// targets and broadcast recipients; the manager never writes it.
    pub fn new(local: PeerIdentity, view: SharedView, policy: ReconnectPolicy) -> Self {
        Self {
            local,
            view,
            policy,
            links: HashMap::new(),
        }
    }

    /// Drains `operations` until shutdown, then closes every link.
    pub async fn run(
        mut self,
        operations: QueueReceiver<Operation>,
        liveness: Liveness,
        poll_interval: Duration,
    ) {
        drain("connection-manager", operations, liveness, poll_interval, |operation| {
            self.execute(operation)
        })
        .await;
        self.links.clear();
        debug!(replica = self.local.id, "connection manager stopped");
    }

    /// Carries out one operation. Never blocks on the network: frames are
    /// queued on the target link and written by its own task.
    pub fn execute(&mut self, operation: Operation) {
        match operation {
            Operation::Unicast { message, target } => self.unicast(&message, target),
            Operation::Broadcast { message } => self.broadcast(&message),
            Operation::Connect { peer } => self.connect(peer),
            Operation::Disconnect { peer } => self.disconnect(peer),
        }
    }

    /// Opens a link unless one is already up or still retrying.
    ///
    /// A link whose reconnect budget ran out is replaced by a fresh one.
    pub fn connect(&mut self, peer: PeerIdentity) {
        if peer.id == self.local.id {
            return;
        }
        if let Some(existing) = self.links.get(&peer.id) {
            if !existing.is_exhausted() {
                return;
            }
            info!(peer = peer.id, "restarting exhausted link");
        }
        debug!(peer = %peer, "opening link");
        let link = PeerLink::spawn(peer.clone(), self.policy);
        self.links.insert(peer.id, link);
    }

    /// Drops the link to `peer`, closing its socket.
    ///
    /// This is a transport event only. The peer stays in the view and a later
    /// unicast or broadcast to it opens a fresh link.
    pub fn disconnect(&mut self, peer: PeerId) {
        if self.links.remove(&peer).is_some() {
            info!(peer, "link closed on request");
        }
    }

    /// Sends to one replica, opening a link first if there is none.
    ///
    /// Targets missing from the view are dropped with a warning, as are
    /// messages to a link whose reconnect budget is spent. Unicasts to
    /// ourselves are skipped.
    pub fn unicast(&mut self, message: &SignedMessage, target: PeerId) {
        if target == self.local.id {
            debug!(kind = ?message.kind(), "skipping unicast to self");
            return;
        }
        if !self.links.contains_key(&target) {
            let Some(peer) = self.view.get(target) else {
                warn!(target, kind = ?message.kind(), "unknown unicast target, dropping message");
                return;
            };
            self.connect(peer);
        }
        self.send(target, message.to_envelope());
    }

    /// Sends to every other member of the current view. Peers are independent:
    /// a dead link only loses its own copy.
    pub fn broadcast(&mut self, message: &SignedMessage) {
        let local_id = self.local.id;
        let targets: Vec<PeerIdentity> = self.view.read(|view| {
            view.members()
                .filter(|peer| peer.id != local_id)
                .cloned()
                .collect()
        });

        let envelope = message.to_envelope();
        for peer in targets {
            let id = peer.id;
            if !self.links.contains_key(&id) {
                self.connect(peer);
            }
            self.send(id, envelope.clone());
        }
    }

    /// The current link to `peer`, if one was ever opened and not closed.
    pub fn link(&self, peer: PeerId) -> Option<&PeerLink> {
        self.links.get(&peer)
    }

    /// True while the link to `peer` has a live connection.
    pub fn is_active(&self, peer: PeerId) -> bool {
        self.links.get(&peer).is_some_and(PeerLink::is_active)
    }

    fn send(&self, target: PeerId, envelope: Envelope) {
        match self.links.get(&target) {
            Some(link) => {
                if !link.send(envelope) {
                    warn!(peer = target, "link is inactive, dropping message");
                }
            }
            None => warn!(peer = target, "no link to peer, dropping message"),
        }
    }
}

/// Accepts replica connections until shutdown.
pub async fn run_listener(
    listener: TcpListener,
    verifier: Verifier,
    input: QueueSender<SignedMessage>,
    liveness: Liveness,
) {
    loop {
        select! {
            _ = liveness.stopped() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted replica connection");
                    tokio::spawn(read_frames(
                        stream,
                        addr,
                        verifier.clone(),
                        input.clone(),
                        liveness.clone(),
                    ));
                }
                Err(err) => warn!(error = ?err, "failed to accept replica connection"),
            }
        }
    }
    debug!("replica listener stopped");
}

async fn read_frames(
    stream: TcpStream,
    addr: SocketAddr,
    verifier: Verifier,
    input: QueueSender<SignedMessage>,
    liveness: Liveness,
) {
    let mut frames = FramedRead::new(stream, EnvelopeCodec);
    loop {
        let frame = select! {
            _ = liveness.stopped() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(envelope)) => match verifier.verify(envelope) {
                Ok(message) => {
                    if !input.push(message) {
                        break;
                    }
                }
                Err(err) => warn!(%addr, error = %err, "dropping inbound frame"),
            },
            Some(Err(err)) => {
                warn!(%addr, error = %err, "closing connection after framing error");
                break;
            }
            None => {
                debug!(%addr, "replica connection closed");
                break;
            }
        }
    }
}
