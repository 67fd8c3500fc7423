//! Dispatch loops.
//!
//! The replica dispatcher is the single consumer of the input queue and the
//! only writer of the membership view. Each popped message goes to the
//! handler registered for its kind; handlers describe network effects by
//! pushing [`Operation`]s and never wait on I/O themselves.
//!
//! The client dispatcher does the same for client requests on its own queue.
//! The two loops are independent: ordering holds within each queue only.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ClientEnvelope;
use crate::error::MessageError;
use crate::identity::{PeerId, PeerIdentity};
use crate::membership::{self, JoinTracker};
use crate::message::{ClientId, ClientReply, ClientRequest, Message, MessageKind, SignedMessage};
use crate::operation::{ClientOperation, Operation};
use crate::queue::{QueueReceiver, QueueSender, drain};
use crate::shutdown::Liveness;
use crate::view::SharedView;

/// Where a delivered text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Replica(PeerId),
    Client(ClientId),
}

/// An application message handed to the embedding program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub origin: Origin,
    pub text: String,
}

/// Everything a handler may touch.
pub struct DispatchContext {
    local: PeerIdentity,
    key: SigningKey,
    view: SharedView,
    join: JoinTracker,
    output: QueueSender<Operation>,
    inbox: mpsc::UnboundedSender<Delivery>,
}

impl DispatchContext {
    pub fn new(
        local: PeerIdentity,
        key: SigningKey,
        view: SharedView,
        join: JoinTracker,
        output: QueueSender<Operation>,
        inbox: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            local,
            key,
            view,
            join,
            output,
            inbox,
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn view(&self) -> &SharedView {
        &self.view
    }

    pub fn join(&self) -> &JoinTracker {
        &self.join
    }

    pub fn emit(&self, operation: Operation) {
        if !self.output.push(operation) {
            debug!("output queue closed, dropping operation");
        }
    }

    /// Signs an outbound message as the local replica.
    pub fn sign(&self, message: Message) -> Result<SignedMessage, MessageError> {
        SignedMessage::sign(self.local.id, message, &self.key)
    }

    pub fn deliver(&self, delivery: Delivery) {
        // Nobody listening is fine: the text has already been logged.
        let _ = self.inbox.send(delivery);
    }
}

pub type Handler = Box<dyn FnMut(&DispatchContext, &SignedMessage) + Send>;

/// Maps message kinds to their handlers.
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Handler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MessageKind::JoinRequest, Box::new(membership::handle_join_request));
        registry.register(MessageKind::Register, Box::new(membership::handle_register));
        registry.register(MessageKind::Text, Box::new(deliver_text));
        registry
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Installs `handler` for `kind`, returning the one it replaces.
    pub fn register(&mut self, kind: MessageKind, handler: Handler) -> Option<Handler> {
        self.handlers.insert(kind, handler)
    }

    fn get_mut(&mut self, kind: MessageKind) -> Option<&mut Handler> {
        self.handlers.get_mut(&kind)
    }
}

fn deliver_text(ctx: &DispatchContext, message: &SignedMessage) {
    let Message::Text(text) = message.message() else {
        return;
    };
    info!(from = message.sender_id(), text = %text.text, "received message");
    ctx.deliver(Delivery {
        origin: Origin::Replica(message.sender_id()),
        text: text.text.clone(),
    });
}

pub struct Dispatcher {
    context: DispatchContext,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(context: DispatchContext, registry: HandlerRegistry) -> Self {
        Self { context, registry }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    /// Processes one verified message.
    pub fn handle(&mut self, message: SignedMessage) {
        let kind = message.kind();
        match self.registry.get_mut(kind) {
            Some(handler) => handler(&self.context, &message),
            None => warn!(?kind, from = message.sender_id(), "no handler registered, dropping message"),
        }
    }

    pub async fn run(
        mut self,
        input: QueueReceiver<SignedMessage>,
        liveness: Liveness,
        poll_interval: Duration,
    ) {
        drain("dispatcher", input, liveness, poll_interval, |message| {
            self.handle(message)
        })
        .await;
    }
}

pub struct ClientDispatcher {
    view: SharedView,
    output: QueueSender<ClientOperation>,
    inbox: mpsc::UnboundedSender<Delivery>,
}

impl ClientDispatcher {
    pub fn new(
        view: SharedView,
        output: QueueSender<ClientOperation>,
        inbox: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            view,
            output,
            inbox,
        }
    }

    pub fn handle(&self, envelope: ClientEnvelope) {
        let ClientEnvelope { client, request } = envelope;
        let reply = match request {
            ClientRequest::Text { text } => {
                info!(client, text = %text, "received client message");
                let _ = self.inbox.send(Delivery {
                    origin: Origin::Client(client),
                    text: text.clone(),
                });
                ClientReply::Ack { text }
            }
            ClientRequest::View => {
                let (members, coordinator) = self
                    .view
                    .read(|view| (view.members().cloned().collect(), view.coordinator_id()));
                ClientReply::View {
                    members,
                    coordinator,
                }
            }
        };
        if !self.output.push(ClientOperation::Respond { client, reply }) {
            debug!(client, "client output queue closed, dropping reply");
        }
    }

    pub async fn run(
        self,
        input: QueueReceiver<ClientEnvelope>,
        liveness: Liveness,
        poll_interval: Duration,
    ) {
        drain("client-dispatcher", input, liveness, poll_interval, |envelope| {
            self.handle(envelope)
        })
        .await;
    }
}
