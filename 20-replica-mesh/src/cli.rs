//! Command-line surface of the `replica` binary.
//!
//! Three positionals identify the replica; everything else has a default so
//! `replica <id> <host> <port>` is enough to start from `./config`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{ReconnectPolicy, ReplicaConfig};
use crate::identity::PeerId;

#[derive(Parser, Debug, Clone)]
#[command(name = "replica", author, version, about = "Run one replica of the mesh", long_about = None)]
pub struct Cli {
    /// Replica id. The lowest id in the view acts as coordinator.
    pub id: PeerId,

    /// Host to bind and to advertise to other replicas.
    pub host: String,

    /// Port for replica-to-replica traffic.
    pub port: u16,

    /// Directory holding `view.json` and the key files.
    #[arg(long, env = "REPLICA_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    /// Port for client connections. Clients are not served without it.
    #[arg(long)]
    pub client_port: Option<u16>,

    /// Delay between reconnect attempts, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub reconnect_interval_ms: u64,

    /// Connect attempts before an outbound link gives up.
    #[arg(long, default_value_t = 100)]
    pub reconnect_attempts: u32,
}

impl Cli {
    pub fn view_path(&self) -> PathBuf {
        self.config_dir.join("view.json")
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        let policy = ReconnectPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.reconnect_attempts,
            ..ReconnectPolicy::default()
        };
        let config = ReplicaConfig::new(self.id, self.host.clone(), self.port).with_reconnect(policy);
        match self.client_port {
            Some(port) => config.with_client_port(port),
            None => config,
        }
    }
}
