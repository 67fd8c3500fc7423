//! Join protocol.
//!
//! A replica boots from a static view. If it finds itself in that view it is
//! a member straight away; otherwise it asks the coordinator (lowest id) to
//! admit it and waits for a `Register` naming itself:
//!
//! ```text
//! Bootstrapping ──(self in view)──────────────────────────▶ Member
//!       │
//!       └──(self missing)──▶ Joining ──(Register(self))──▶ Member
//! ```
//!
//! A member that is not the coordinator passes the request on to the
//! coordinator it knows, so a bootstrap file naming a displaced coordinator
//! still gets the joiner admitted.
//!
//! There is no timeout on the handshake: a joiner whose request or
//! registration is lost stays in `Joining`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchContext;
use crate::identity::PeerIdentity;
use crate::message::{Message, SignedMessage};
use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Bootstrapping,
    Joining,
    Member,
}

/// Observable join state. Written by the dispatch loop only.
#[derive(Debug, Clone)]
pub struct JoinTracker {
    state: Arc<watch::Sender<JoinState>>,
}

impl Default for JoinTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(JoinState::Bootstrapping);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn get(&self) -> JoinState {
        *self.state.borrow()
    }

    /// Returns `true` if the state changed.
    pub fn set(&self, next: JoinState) -> bool {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "join state changed");
        }
        previous != next
    }

    /// Waits until the state equals `target`, or `timeout` elapses.
    pub async fn wait_for(&self, target: JoinState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|changed| changed.is_ok())
    }
}

/// Runs the bootstrapping step against the loaded view.
///
/// Opens links to every other known member, then either settles as a member
/// or emits the join request to the coordinator.
pub fn bootstrap(ctx: &DispatchContext) -> Result<()> {
    let local = ctx.local().clone();
    let others: Vec<PeerIdentity> = ctx.view().read(|view| {
        view.members()
            .filter(|peer| peer.id != local.id)
            .cloned()
            .collect()
    });
    for peer in others {
        ctx.emit(Operation::Connect { peer });
    }

    if ctx.view().read(|view| view.contains(local.id)) {
        ctx.join().set(JoinState::Member);
        info!(replica = local.id, "found in bootstrap view, starting as member");
        return Ok(());
    }

    let Some(coordinator) = ctx.view().coordinator_id() else {
        ctx.view().add_member(local.clone());
        ctx.join().set(JoinState::Member);
        info!(replica = local.id, "empty bootstrap view, starting as sole member");
        return Ok(());
    };

    ctx.join().set(JoinState::Joining);
    let request = ctx
        .sign(Message::JoinRequest(local.clone()))
        .context("failed to sign join request")?;
    ctx.emit(Operation::Unicast {
        message: request,
        target: coordinator,
    });
    info!(replica = local.id, coordinator, "requesting to join");
    Ok(())
}

/// Handles a `JoinRequest` on any replica.
///
/// The coordinator admits the joiner locally, announces it to the whole view
/// (which now includes the joiner), and sends the joiner one `Register` per
/// existing member so its view catches up with ours.
///
/// Any other member forwards the request, still signed by the joiner, to the
/// coordinator it knows. Each hop goes to a strictly lower id. Replicas that
/// are not members yet drop requests.
pub fn handle_join_request(ctx: &DispatchContext, message: &SignedMessage) {
    let Message::JoinRequest(joiner) = message.message() else {
        return;
    };
    if ctx.join().get() != JoinState::Member {
        debug!(joiner = joiner.id, "not a member yet, dropping join request");
        return;
    }
    let local_id = ctx.local().id;
    let Some(coordinator) = ctx.view().coordinator_id() else {
        return;
    };

    if coordinator != local_id {
        if coordinator == joiner.id {
            debug!(joiner = joiner.id, "joiner is already the coordinator, dropping request");
            return;
        }
        info!(joiner = joiner.id, coordinator, "forwarding join request to coordinator");
        ctx.emit(Operation::Unicast {
            message: message.clone(),
            target: coordinator,
        });
        return;
    }

    info!(joiner = %joiner, "admitting replica");
    register(ctx, joiner.clone());

    match ctx.sign(Message::Register(joiner.clone())) {
        Ok(announcement) => ctx.emit(Operation::Broadcast {
            message: announcement,
        }),
        Err(err) => warn!(joiner = joiner.id, error = %err, "failed to sign registration"),
    }

    let members: Vec<PeerIdentity> = ctx.view().read(|view| {
        view.members()
            .filter(|peer| peer.id != joiner.id)
            .cloned()
            .collect()
    });
    for member in members {
        let member_id = member.id;
        match ctx.sign(Message::Register(member)) {
            Ok(catch_up) => ctx.emit(Operation::Unicast {
                message: catch_up,
                target: joiner.id,
            }),
            Err(err) => warn!(member = member_id, error = %err, "failed to sign registration"),
        }
    }
}

/// Any replica: learn the announced peer and open a link to it.
pub fn handle_register(ctx: &DispatchContext, message: &SignedMessage) {
    let Message::Register(peer) = message.message() else {
        return;
    };

    if peer.id == ctx.local().id {
        ctx.view().add_member(ctx.local().clone());
        if ctx.join().set(JoinState::Member) {
            info!(replica = peer.id, "registered by coordinator, now a member");
        }
        return;
    }

    register(ctx, peer.clone());
}

fn register(ctx: &DispatchContext, peer: PeerIdentity) {
    if ctx.view().add_member(peer.clone()) {
        info!(peer = %peer, "registered replica");
        ctx.emit(Operation::Connect { peer });
    }
}
