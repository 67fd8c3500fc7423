//! Errors raised while turning an inbound frame into a message.
//!
//! They stay at the reader that hit them: the frame is logged and dropped,
//! and nothing is reported across a queue.

use thiserror::Error;

use crate::identity::PeerId;

/// Reasons an inbound frame is refused before it reaches a dispatch loop.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame from replica {0} carries no signature")]
    Unsigned(PeerId),
    #[error("no public key known for replica {0}")]
    UnknownSender(PeerId),
    #[error("signature from replica {0} does not verify")]
    BadSignature(PeerId),
    #[error("malformed payload: {0}")]
    Decode(#[from] bincode::Error),
}
