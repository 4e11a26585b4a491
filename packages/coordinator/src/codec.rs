//! Payload protection codec
//!
//! Wraps transfer metadata in AES-256-GCM before it crosses a chain
//! boundary. The tag is kept detached so it can be carried and checked
//! independently; the key id is bound as associated data.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BridgeError, BridgeResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Ciphertext plus integrity tag, labelled with the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedPayload {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub tag: Vec<u8>,
    pub key_id: String,
}

/// 256-bit payload key, zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadKey([u8; 32]);

impl PayloadKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> BridgeResult<Self> {
        let mut bytes = hex::decode(hex_str.trim().trim_start_matches("0x"))
            .map_err(|e| BridgeError::Config(format!("payload key is not hex: {}", e)))?;
        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(BridgeError::Config(format!(
                "payload key must be 32 bytes, got {}",
                len
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }
}

impl fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadKey(<redacted>)")
    }
}

/// Key handles available to the codec. Lifecycle (rotation, KEM
/// encapsulation) belongs to the key-management side.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, PayloadKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: impl Into<String>, key: PayloadKey) -> Self {
        self.keys.insert(key_id.into(), key);
        self
    }

    /// Parse `id:hex,id2:hex` as carried in `PAYLOAD_KEYS`
    pub fn parse(raw: &str) -> BridgeResult<Self> {
        let mut ring = KeyRing::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, hex_key) = entry
                .split_once(':')
                .ok_or_else(|| BridgeError::Config("payload key entry must be id:hex".into()))?;
            if id.is_empty() {
                return Err(BridgeError::Config("payload key id cannot be empty".into()));
            }
            ring.keys.insert(id.to_string(), PayloadKey::from_hex(hex_key)?);
        }
        Ok(ring)
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn cipher(&self, key_id: &str) -> BridgeResult<Aes256Gcm> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| BridgeError::UnknownKey(key_id.to_string()))?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)))
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("KeyRing").field("key_ids", &ids).finish()
    }
}

/// Stateless codec over a key ring
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    keys: KeyRing,
}

impl PayloadCodec {
    pub fn new(keys: KeyRing) -> Self {
        Self { keys }
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.keys.contains(key_id)
    }

    /// Encrypt `payload` under `key_id`
    pub fn protect(&self, payload: &[u8], key_id: &str) -> BridgeResult<ProtectedPayload> {
        let cipher = self.keys.cipher(key_id)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut buffer = payload.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), key_id.as_bytes(), &mut buffer)
            .map_err(|_| BridgeError::Config("payload too large to protect".into()))?;

        Ok(ProtectedPayload {
            ciphertext: buffer,
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
            key_id: key_id.to_string(),
        })
    }

    /// Decrypt and authenticate; any alteration yields `IntegrityError`
    pub fn unprotect(&self, protected: &ProtectedPayload) -> BridgeResult<Vec<u8>> {
        let cipher = self.keys.cipher(&protected.key_id)?;

        if protected.nonce.len() != NONCE_LEN || protected.tag.len() != TAG_LEN {
            return Err(BridgeError::IntegrityError);
        }

        let mut buffer = protected.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&protected.nonce),
                protected.key_id.as_bytes(),
                &mut buffer,
                Tag::from_slice(&protected.tag),
            )
            .map_err(|_| BridgeError::IntegrityError)?;

        Ok(buffer)
    }
}

/// Serialize byte vectors as lowercase hex strings
pub mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(D::Error::custom)
    }
}
