//! Signing keys and local trust storage.
//!
//! Every replica owns an ed25519 key pair. The private half signs outbound
//! payloads; public halves of other replicas come either from the bootstrap
//! view or from the trust store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;

use crate::identity::{PeerId, PublicKey};

/// Source of the local signing key and of trusted peer keys.
pub trait KeyStore: Send + Sync {
    /// Loads the key pair for `id`, creating and persisting one if none exists.
    fn load_or_generate(&self, id: PeerId) -> Result<SigningKey>;

    /// Public key for `id` if the store trusts one.
    fn public_key(&self, id: PeerId) -> Option<PublicKey>;
}

pub fn sign(key: &SigningKey, bytes: &[u8]) -> Vec<u8> {
    key.sign(bytes).to_bytes().to_vec()
}

/// Checks a detached signature. Malformed keys or signatures simply fail.
pub fn verify(bytes: &[u8], signature: &[u8], key: &PublicKey) -> bool {
    let Some(verifying_key) = key.verifying_key() else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(bytes, &signature).is_ok()
}

/// Keys stored as hex files: `<id>.key` (private) and `<id>.pub` (public).
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn private_path(&self, id: PeerId) -> PathBuf {
        self.dir.join(format!("{id}.key"))
    }

    fn public_path(&self, id: PeerId) -> PathBuf {
        self.dir.join(format!("{id}.pub"))
    }
}

impl KeyStore for FileKeyStore {
    fn load_or_generate(&self, id: PeerId) -> Result<SigningKey> {
        let private_path = self.private_path(id);
        if private_path.exists() {
            let bytes = read_key_file(&private_path)?;
            return Ok(SigningKey::from_bytes(&bytes));
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create key directory {}", self.dir.display()))?;
        let key = SigningKey::generate(&mut OsRng);
        fs::write(&private_path, hex::encode(key.to_bytes()))
            .with_context(|| format!("failed to write {}", private_path.display()))?;
        let public_path = self.public_path(id);
        fs::write(&public_path, hex::encode(key.verifying_key().to_bytes()))
            .with_context(|| format!("failed to write {}", public_path.display()))?;
        Ok(key)
    }

    fn public_key(&self, id: PeerId) -> Option<PublicKey> {
        let path = self.public_path(id);
        if !path.exists() {
            return None;
        }
        match read_public_key(&path) {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::warn!(peer = id, error = ?err, "ignoring unreadable public key");
                None
            }
        }
    }
}

/// Reads a hex-encoded public key file.
pub fn read_public_key(path: &Path) -> Result<PublicKey> {
    read_key_file(path).map(PublicKey::from_bytes)
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("key file {} is not valid hex", path.display()))?;
    bytes
        .try_into()
        .map_err(|raw: Vec<u8>| anyhow!("key file {} holds {} bytes, expected 32", path.display(), raw.len()))
}

/// In-process key store. Generated keys are remembered, so every replica
/// sharing one store trusts every other.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<PeerId, SigningKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_or_generate(&self, id: PeerId) -> Result<SigningKey> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .entry(id)
            .or_insert_with(|| SigningKey::generate(&mut OsRng))
            .clone())
    }

    fn public_key(&self, id: PeerId) -> Option<PublicKey> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(&id).map(|key| key.verifying_key().into())
    }
}
