//! Replica configuration and the bootstrap view file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::identity::{PeerId, PeerIdentity};
use crate::keys;
use crate::view::MembershipView;

/// Wait between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(250);

/// Attempts before a link gives up and stays inactive.
pub const RECONNECT_ATTEMPTS: u32 = 100;

/// Upper bound on a single TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long an idle dispatch loop sleeps before re-checking liveness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How an outbound link retries after losing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_attempts: RECONNECT_ATTEMPTS,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Settings for one replica process.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    /// Port for client connections; `None` disables the client listener.
    pub client_port: Option<u16>,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
}

impl ReplicaConfig {
    pub fn new(id: PeerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            client_port: None,
            reconnect: ReconnectPolicy::default(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_port = Some(port);
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.id, self.host.clone(), self.port)
    }
}

/// On-disk layout of `view.json`.
#[derive(Debug, Deserialize)]
struct ViewFile {
    replicas: Vec<ViewEntry>,
}

#[derive(Debug, Deserialize)]
struct ViewEntry {
    id: PeerId,
    host: String,
    port: u16,
    /// Hex public key file, relative to the view file.
    #[serde(default)]
    public_key: Option<PathBuf>,
}

/// Loads the static bootstrap view.
///
/// Any unreadable entry, including a referenced key file, fails the whole
/// load: a replica must not start from a partial view.
pub fn load_initial_view(path: &Path) -> Result<MembershipView> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read view file {}", path.display()))?;
    let file: ViewFile = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse view file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut view = MembershipView::new();
    for entry in file.replicas {
        let mut peer = PeerIdentity::new(entry.id, entry.host, entry.port);
        if let Some(key_file) = entry.public_key {
            let key_path = base.join(key_file);
            let key = keys::read_public_key(&key_path)
                .with_context(|| format!("failed to load public key for replica {}", entry.id))?;
            peer = peer.with_public_key(key);
        }
        if !view.add_member(peer) {
            tracing::warn!(peer = entry.id, "duplicate replica id in view file, keeping first entry");
        }
    }
    Ok(view)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;
    use crate::identity::PublicKey;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replica-mesh-view-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_members_and_key_files() {
        let dir = temp_dir("load");
        let key = SigningKey::generate(&mut OsRng);
        fs::write(dir.join("1.pub"), hex::encode(key.verifying_key().to_bytes())).unwrap();
        fs::write(
            dir.join("view.json"),
            r#"{"replicas": [
                {"id": 2, "host": "127.0.0.1", "port": 7102},
                {"id": 1, "host": "127.0.0.1", "port": 7101, "public_key": "1.pub"}
            ]}"#,
        )
        .unwrap();

        let view = load_initial_view(&dir.join("view.json")).expect("load view");
        assert_eq!(view.ids(), vec![1, 2]);
        assert_eq!(view.coordinator_id(), Some(1));
        assert_eq!(
            view.get(1).and_then(|p| p.public_key),
            Some(PublicKey::from(key.verifying_key()))
        );
        assert!(view.get(2).and_then(|p| p.public_key).is_none());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_key_file_fails_the_load() {
        let dir = temp_dir("missing-key");
        fs::write(
            dir.join("view.json"),
            r#"{"replicas": [{"id": 1, "host": "h", "port": 1, "public_key": "nope.pub"}]}"#,
        )
        .unwrap();

        let err = load_initial_view(&dir.join("view.json")).unwrap_err();
        assert!(format!("{err:#}").contains("replica 1"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_view_file_is_an_error() {
        assert!(load_initial_view(Path::new("/definitely/not/here/view.json")).is_err());
    }

    #[test]
    fn defaults_match_documented_timings() {
        let config = ReplicaConfig::new(1, "127.0.0.1", 7101);
        assert_eq!(config.reconnect.interval, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_attempts, 100);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.client_port, None);
    }
}
