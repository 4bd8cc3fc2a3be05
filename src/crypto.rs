//! Seal/open boundary for message payloads
//!
//! The client only ever moves sealed bytes. Applications plug their
//! public-key scheme in through [`Sealer`] and [`KeyStore`]; failures to find
//! a key surface as [`KeyNotFound`] without being wrapped or retried.

use crate::client::Client;
use crate::error::ClientError;
use crate::protocol::Identity;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Key not found for {0}")]
pub struct KeyNotFound(pub String);

/// Envelope encryption used for direct messages
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8], recipient_public_key: &[u8]) -> Result<Vec<u8>, KeyNotFound>;

    fn open(&self, sealed: &[u8], own_private_key: &[u8]) -> Result<Vec<u8>, KeyNotFound>;
}

/// Resolves identities to public key blobs and holds the local private key
pub trait KeyStore: Send + Sync {
    fn public_key(&self, identity: &Identity) -> Result<Vec<u8>, KeyNotFound>;

    fn private_key(&self) -> Result<Vec<u8>, KeyNotFound>;
}

/// Passes payloads through unchanged. Offers no confidentiality.
#[derive(Debug, Clone, Copy)]
pub struct PlaintextSealer;

impl PlaintextSealer {
    pub fn new() -> Self {
        warn!("Using plaintext sealer: message payloads are not encrypted");
        Self
    }
}

impl Default for PlaintextSealer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sealer for PlaintextSealer {
    fn seal(&self, plaintext: &[u8], _recipient_public_key: &[u8]) -> Result<Vec<u8>, KeyNotFound> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8], _own_private_key: &[u8]) -> Result<Vec<u8>, KeyNotFound> {
        Ok(sealed.to_vec())
    }
}

/// Fixed in-memory key material
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    public_keys: HashMap<String, Vec<u8>>,
    private_key: Option<Vec<u8>>,
    owner: Option<String>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key store that trusts every identity with an empty key, for [`PlaintextSealer`]
    pub fn permissive(owner: &Identity) -> PermissiveKeyStore {
        PermissiveKeyStore {
            owner: owner.clone(),
        }
    }

    pub fn with_private_key(mut self, owner: &Identity, key: impl Into<Vec<u8>>) -> Self {
        self.owner = Some(owner.to_string());
        self.private_key = Some(key.into());
        self
    }

    pub fn with_public_key(mut self, identity: &Identity, key: impl Into<Vec<u8>>) -> Self {
        self.public_keys.insert(identity.to_string(), key.into());
        self
    }
}

impl KeyStore for StaticKeyStore {
    fn public_key(&self, identity: &Identity) -> Result<Vec<u8>, KeyNotFound> {
        self.public_keys
            .get(identity.as_str())
            .cloned()
            .ok_or_else(|| KeyNotFound(identity.to_string()))
    }

    fn private_key(&self) -> Result<Vec<u8>, KeyNotFound> {
        self.private_key.clone().ok_or_else(|| {
            KeyNotFound(
                self.owner
                    .clone()
                    .unwrap_or_else(|| "local identity".to_string()),
            )
        })
    }
}

/// Hands out empty keys for every identity
#[derive(Debug, Clone)]
pub struct PermissiveKeyStore {
    owner: Identity,
}

impl KeyStore for PermissiveKeyStore {
    fn public_key(&self, _identity: &Identity) -> Result<Vec<u8>, KeyNotFound> {
        Ok(Vec::new())
    }

    fn private_key(&self) -> Result<Vec<u8>, KeyNotFound> {
        debug!(identity = %self.owner, "Using empty private key");
        Ok(Vec::new())
    }
}

/// Seals outgoing text and opens incoming payloads around a [`Client`]
pub struct SealedMessenger<S, K> {
    client: Arc<Client>,
    sealer: S,
    keys: K,
}

impl<S: Sealer, K: KeyStore> SealedMessenger<S, K> {
    pub fn new(client: Arc<Client>, sealer: S, keys: K) -> Self {
        Self {
            client,
            sealer,
            keys,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Seal `text` for `recipient` and queue it
    pub fn send_text(&self, recipient: Identity, text: &str) -> Result<Uuid, ClientError> {
        let public_key = self.keys.public_key(&recipient)?;
        let sealed = self.sealer.seal(text.as_bytes(), &public_key)?;
        self.client.enqueue(recipient, sealed)
    }

    /// Open a payload received by the consume loop
    pub fn open_text(&self, sealed: &[u8]) -> Result<String, ClientError> {
        let private_key = self.keys.private_key()?;
        let plaintext = self.sealer.open(sealed, &private_key)?;
        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }
}
