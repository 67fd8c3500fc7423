//! Outbound intents produced by the dispatch loops.
//!
//! Dispatch never touches a socket. It describes what should happen on the
//! network as an [`Operation`] (or a [`ClientOperation`] on the client path)
//! and the matching sender task carries it out.

use crate::identity::{PeerId, PeerIdentity};
use crate::message::{ClientId, ClientReply, SignedMessage};

#[derive(Debug, Clone)]
pub enum Operation {
    /// Send to one replica, opening a link to it if none exists.
    Unicast { message: SignedMessage, target: PeerId },
    /// Send to every member of the current view except ourselves.
    Broadcast { message: SignedMessage },
    /// Open an outbound link. No-op when one is already up or retrying.
    Connect { peer: PeerIdentity },
    /// Close the outbound link. The peer stays in the view.
    Disconnect { peer: PeerId },
}

#[derive(Debug, Clone)]
pub enum ClientOperation {
    Respond { client: ClientId, reply: ClientReply },
}
