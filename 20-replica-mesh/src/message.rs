//! Application messages and their signed wrapper.
//!
//! [`Message`] is the closed set of things replicas say to each other. On the
//! wire it is a bincode payload inside a signed [`Envelope`]; in memory it
//! travels as a [`SignedMessage`], which keeps the exact payload bytes and the
//! signature next to the decoded value so a message can be forwarded without
//! re-signing.

use std::sync::Arc;

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::identity::{PeerId, PeerIdentity, PublicKey};
use crate::keys::{self, KeyStore};
use crate::view::SharedView;
use crate::wire::Envelope;

/// Identifier assigned to each accepted client connection.
pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Text(TextMessage),
    /// Sent by a replica missing from its bootstrap view to the coordinator.
    JoinRequest(PeerIdentity),
    /// Announces a member; receivers add it to their view.
    Register(PeerIdentity),
}

/// Registry key for message handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    JoinRequest,
    Register,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text(TextMessage { text: text.into() })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::JoinRequest(_) => MessageKind::JoinRequest,
            Message::Register(_) => MessageKind::Register,
        }
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

/// A [`Message`] together with its sender and detached signature.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    sender_id: PeerId,
    message: Message,
    payload: Bytes,
    signature: Bytes,
}

impl SignedMessage {
    /// Serializes and signs an outbound message with the local key.
    pub fn sign(sender_id: PeerId, message: Message, key: &SigningKey) -> Result<Self, MessageError> {
        let payload = Bytes::from(message.encode()?);
        let signature = Bytes::from(keys::sign(key, &payload));
        Ok(Self {
            sender_id,
            message,
            payload,
            signature,
        })
    }

    /// Builds a message from an inbound envelope, checking its signature.
    ///
    /// `resolve` maps the claimed sender to a trusted key. It also sees the
    /// decoded message, which lets a join request vouch for its own key.
    pub fn verify<F>(envelope: Envelope, resolve: F) -> Result<Self, MessageError>
    where
        F: FnOnce(PeerId, &Message) -> Option<PublicKey>,
    {
        let Envelope {
            sender_id,
            payload,
            signature,
        } = envelope;
        let signature = signature.ok_or(MessageError::Unsigned(sender_id))?;
        let message = Message::decode(&payload)?;
        let key = resolve(sender_id, &message).ok_or(MessageError::UnknownSender(sender_id))?;
        if !keys::verify(&payload, &signature, &key) {
            return Err(MessageError::BadSignature(sender_id));
        }
        Ok(Self {
            sender_id,
            message,
            payload,
            signature,
        })
    }

    pub fn sender_id(&self) -> PeerId {
        self.sender_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// The signed payload bytes.
    pub fn serialize(&self) -> &Bytes {
        &self.payload
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::signed(self.sender_id, self.payload.clone(), self.signature.clone())
    }
}

/// Resolves sender keys for inbound frames on the replica path.
///
/// Lookup order: the key recorded in the view, then the trust store, then
/// (for join requests only) the key the joiner presents for itself.
#[derive(Clone)]
pub struct Verifier {
    view: SharedView,
    keys: Arc<dyn KeyStore>,
}

impl Verifier {
    pub fn new(view: SharedView, keys: Arc<dyn KeyStore>) -> Self {
        Self { view, keys }
    }

    pub fn verify(&self, envelope: Envelope) -> Result<SignedMessage, MessageError> {
        SignedMessage::verify(envelope, |sender, message| self.resolve(sender, message))
    }

    fn resolve(&self, sender: PeerId, message: &Message) -> Option<PublicKey> {
        self.view
            .get(sender)
            .and_then(|peer| peer.public_key)
            .or_else(|| self.keys.public_key(sender))
            .or_else(|| match message {
                Message::JoinRequest(joiner) if joiner.id == sender => joiner.public_key,
                _ => None,
            })
    }
}

/// Requests a client may send to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Text { text: String },
    View,
}

/// Replies a replica sends back to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Ack {
        text: String,
    },
    View {
        members: Vec<PeerIdentity>,
        coordinator: Option<PeerId>,
    },
    Error {
        message: String,
    },
}

impl ClientRequest {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl ClientReply {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}
