//! Replica mesh: a group of peer processes that keep a shared membership
//! view and exchange signed messages over TCP.
//!
//! Each replica is a set of tokio tasks connected by queues:
//!
//! - **Listener**: accepts replica connections, decodes tagged frames,
//!   verifies signatures, and pushes messages to the input queue
//! - **Dispatcher**: pops one message at a time, applies the join protocol or
//!   an application handler, and pushes operations to the output queue
//! - **Connection manager**: turns operations into writes on per-peer links,
//!   each with its own bounded reconnect loop
//! - **Client path**: the same pipeline for client connections, on legacy
//!   framing and its own queues
//!
//! The dispatcher is the only writer of the membership view. Network and
//! signature failures are logged where they happen and never cross a queue.
//!
//! # Modules
//!
//! - [`runtime`]: replica startup and [`runtime::ReplicaHandle`]
//! - [`membership`]: join state machine and the `JoinRequest`/`Register` handlers
//! - [`dispatch`]: dispatch loops and the handler registry
//! - [`connection`]: connection manager and replica listener
//! - [`link`]: outbound links with bounded reconnection
//! - [`client`]: client listener and reply routing
//! - [`wire`]: legacy and tagged frame codecs
//! - [`message`]: application messages and signed wrappers
//! - [`view`]: membership view
//! - [`keys`]: signing and key storage
//! - [`config`] / [`cli`]: replica settings and the bootstrap view file

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod keys;
pub mod link;
pub mod membership;
pub mod message;
pub mod operation;
pub mod queue;
pub mod runtime;
pub mod shutdown;
pub mod view;
pub mod wire;
