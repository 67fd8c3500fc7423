//! Replica startup and the handle used to drive a running replica.
//!
//! [`Replica::start`] wires the units of one replica together:
//!
//! - **Listener**: accepts replica connections, verifies frames, feeds the input queue
//! - **Dispatcher**: single consumer of the input queue, sole writer of the view
//! - **Connection manager**: drains the output queue onto per-peer links
//! - **Client listener / client dispatcher / client sender**: the same shape
//!   for client connections, only when a client port is configured
//!
//! Every queue is created here and handed to the units that use it. A shared
//! [`Liveness`] flag stops all of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::{ClientDirectory, ClientSender, run_client_listener};
use crate::config::ReplicaConfig;
use crate::connection::{ConnectionManager, run_listener};
use crate::dispatch::{ClientDispatcher, Delivery, DispatchContext, Dispatcher, HandlerRegistry};
use crate::identity::{PeerId, PeerIdentity};
use crate::keys::KeyStore;
use crate::membership::{self, JoinState, JoinTracker};
use crate::message::{Message, SignedMessage, Verifier};
use crate::operation::Operation;
use crate::queue::{QueueSender, queue};
use crate::shutdown::Liveness;
use crate::view::{MembershipView, SharedView};

pub struct Replica;

impl Replica {
    /// Starts a replica with the default message handlers.
    pub async fn start(
        config: ReplicaConfig,
        bootstrap: MembershipView,
        keys: Arc<dyn KeyStore>,
    ) -> Result<ReplicaHandle> {
        Self::start_with_handlers(config, bootstrap, keys, HandlerRegistry::default()).await
    }

    /// Starts a replica whose dispatcher uses `registry`.
    ///
    /// Fails if the local key cannot be loaded or a listener cannot be bound.
    pub async fn start_with_handlers(
        config: ReplicaConfig,
        mut bootstrap: MembershipView,
        keys: Arc<dyn KeyStore>,
        registry: HandlerRegistry,
    ) -> Result<ReplicaHandle> {
        let key = keys
            .load_or_generate(config.id)
            .with_context(|| format!("failed to load key pair for replica {}", config.id))?;
        let local = config
            .identity()
            .with_public_key(key.verifying_key().into());

        for id in bootstrap.ids() {
            if let Some(public_key) = keys.public_key(id) {
                bootstrap.resolve_public_key(id, public_key);
            }
        }
        let view = SharedView::new(bootstrap);

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind replica listener on {}", local.addr()))?;
        let replica_addr = listener.local_addr()?;
        let client_listener = match config.client_port {
            Some(port) => {
                let listener = TcpListener::bind((config.host.as_str(), port))
                    .await
                    .with_context(|| format!("failed to bind client listener on {}:{port}", config.host))?;
                Some(listener)
            }
            None => None,
        };
        let client_addr = client_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let liveness = Liveness::new();
        let join = JoinTracker::new();
        let (input_tx, input_rx) = queue::<SignedMessage>();
        let (output_tx, output_rx) = queue::<Operation>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Delivery>();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_listener(
            listener,
            Verifier::new(view.clone(), Arc::clone(&keys)),
            input_tx,
            liveness.clone(),
        )));
        tasks.push(tokio::spawn(
            ConnectionManager::new(local.clone(), view.clone(), config.reconnect).run(
                output_rx,
                liveness.clone(),
                config.poll_interval,
            ),
        ));

        if let Some(client_listener) = client_listener {
            let directory = ClientDirectory::new();
            let (client_in_tx, client_in_rx) = queue();
            let (client_out_tx, client_out_rx) = queue();
            tasks.push(tokio::spawn(run_client_listener(
                client_listener,
                directory.clone(),
                client_in_tx,
                liveness.clone(),
            )));
            tasks.push(tokio::spawn(
                ClientDispatcher::new(view.clone(), client_out_tx, inbox_tx.clone()).run(
                    client_in_rx,
                    liveness.clone(),
                    config.poll_interval,
                ),
            ));
            tasks.push(tokio::spawn(ClientSender::new(directory).run(
                client_out_rx,
                liveness.clone(),
                config.poll_interval,
            )));
        }

        let context = DispatchContext::new(
            local.clone(),
            key.clone(),
            view.clone(),
            join.clone(),
            output_tx.clone(),
            inbox_tx,
        );
        // Bootstrap writes the view before the dispatcher takes over as its writer.
        membership::bootstrap(&context)?;
        tasks.push(tokio::spawn(Dispatcher::new(context, registry).run(
            input_rx,
            liveness.clone(),
            config.poll_interval,
        )));

        info!(
            replica = local.id,
            %replica_addr,
            client_addr = ?client_addr,
            state = ?join.get(),
            "replica started"
        );

        Ok(ReplicaHandle {
            identity: local,
            key,
            view,
            join,
            output: output_tx,
            deliveries: inbox_rx,
            replica_addr,
            client_addr,
            liveness,
            tasks,
        })
    }
}

/// Handle to a running replica.
///
/// Dropping the handle stops the replica without waiting for its tasks;
/// [`ReplicaHandle::shutdown`] waits for them.
pub struct ReplicaHandle {
    identity: PeerIdentity,
    key: SigningKey,
    view: SharedView,
    join: JoinTracker,
    output: QueueSender<Operation>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    replica_addr: SocketAddr,
    client_addr: Option<SocketAddr>,
    liveness: Liveness,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplicaHandle {
    /// Local identity, including the public key loaded at startup.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn id(&self) -> PeerId {
        self.identity.id
    }

    /// Address the replica listener is bound to.
    pub fn replica_addr(&self) -> SocketAddr {
        self.replica_addr
    }

    /// Address of the client listener, or `None` when no client port was configured.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// A copy of the current membership view.
    pub fn view(&self) -> MembershipView {
        self.view.snapshot()
    }

    /// Where the replica is in the join protocol.
    pub fn join_state(&self) -> JoinState {
        self.join.get()
    }

    /// Waits until the join state equals `state`. Returns `false` on timeout.
    ///
    /// The join handshake has no timeout of its own, so this is how callers
    /// bound how long they wait for membership.
    pub async fn wait_for_state(&self, state: JoinState, timeout: Duration) -> bool {
        self.join.wait_for(state, timeout).await
    }

    /// Signs `text` and sends it to one replica.
    pub fn send_text(&self, target: PeerId, text: impl Into<String>) -> Result<()> {
        let message = self.sign(Message::text(text))?;
        self.submit(Operation::Unicast { message, target });
        Ok(())
    }

    /// Signs `text` and sends it to every other member.
    pub fn broadcast_text(&self, text: impl Into<String>) -> Result<()> {
        let message = self.sign(Message::text(text))?;
        self.submit(Operation::Broadcast { message });
        Ok(())
    }

    /// Queues a raw operation for the connection manager.
    /// Returns `false` once the connection manager has stopped.
    pub fn submit(&self, operation: Operation) -> bool {
        self.output.push(operation)
    }

    /// Waits up to `timeout` for the next delivered text.
    pub async fn next_delivery(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.deliveries.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next delivered text if one is already waiting.
    pub fn try_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    /// Stops every unit and waits for their tasks to finish.
    pub async fn shutdown(mut self) {
        self.liveness.shutdown();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        info!(replica = self.identity.id, "replica stopped");
    }

    fn sign(&self, message: Message) -> Result<SignedMessage> {
        SignedMessage::sign(self.identity.id, message, &self.key).context("failed to sign message")
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        if self.liveness.is_alive() {
            debug!(replica = self.identity.id, "replica handle dropped, stopping");
            self.liveness.shutdown();
        }
    }
}
