//! Persistent key-pair storage
//!
//! The storage backend is a plain string key-value store, matching the
//! device-local storage interface the surrounding application provides.
//! Key pairs are stored as base64 JSON under a per-user key.

use crate::engine;
use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sidetalk_types::KeyPair;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Device-local string key-value storage
pub trait KeyStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// One file per key under a directory
pub struct FileKeyStorage {
    dir: PathBuf,
}

impl FileKeyStorage {
    /// Create a store rooted at `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| CryptoError::KeyStorage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Default location under the platform data directory
    pub fn default_location() -> Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| CryptoError::KeyStorage("no platform data directory".to_string()))?;
        Self::new(base.join("sidetalk").join("keys"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are caller-controlled strings; keep filenames tame
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(safe)
    }
}

impl KeyStorage for FileKeyStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::KeyStorage(format!("read {key}: {e}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::write(self.path_for(key), value)
            .map_err(|e| CryptoError::KeyStorage(format!("write {key}: {e}")))
    }
}

/// In-memory storage for tests and ephemeral clients
#[derive(Default)]
pub struct MemoryKeyStorage {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self
            .map
            .lock()
            .map_err(|_| CryptoError::KeyStorage("storage lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| CryptoError::KeyStorage("storage lock poisoned".to_string()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Stored representation: base64 JSON, the shape the original web client
/// kept in localStorage
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    public_key: String,
    secret_key: String,
}

/// Generates, persists, and retrieves per-user key pairs
pub struct KeyStore {
    storage: Box<dyn KeyStorage>,
    // Serializes ensure_key_pair so concurrent callers for the same user
    // cannot generate two different pairs
    lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(storage: Box<dyn KeyStorage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Return the persisted key pair for `user_id`, generating and storing
    /// a new one if none exists
    ///
    /// Unparseable stored data is treated as "no key pair found" and
    /// triggers regeneration; the old private key is lost and messages
    /// encrypted to it become unreadable, hence the loud warning.
    pub fn ensure_key_pair(&self, user_id: &str) -> Result<KeyPair> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CryptoError::KeyStorage("keystore lock poisoned".to_string()))?;

        let storage_key = Self::storage_key(user_id);
        if let Some(raw) = self.storage.get(&storage_key)? {
            match Self::parse(&raw) {
                Ok(pair) => {
                    debug!(user_id, "loaded existing key pair");
                    return Ok(pair);
                }
                Err(e) => {
                    warn!(
                        user_id,
                        error = %e,
                        "stored key pair is corrupt; regenerating - previously received \
                         messages will no longer decrypt"
                    );
                }
            }
        }

        let pair = engine::generate_key_pair();
        self.storage.set(&storage_key, &Self::serialize(&pair))?;
        debug!(user_id, "generated and persisted new key pair");
        Ok(pair)
    }

    fn storage_key(user_id: &str) -> String {
        format!("chat_keypair_{user_id}")
    }

    fn serialize(pair: &KeyPair) -> String {
        let stored = StoredKeyPair {
            public_key: BASE64.encode(pair.public_key),
            secret_key: BASE64.encode(pair.secret_key),
        };
        // Serializing two strings cannot fail
        serde_json::to_string(&stored).unwrap_or_default()
    }

    fn parse(raw: &str) -> Result<KeyPair> {
        let stored: StoredKeyPair = serde_json::from_str(raw)
            .map_err(|e| CryptoError::KeyStorage(format!("invalid stored key pair: {e}")))?;
        Ok(KeyPair::new(
            Self::decode_key(&stored.public_key)?,
            Self::decode_key(&stored.secret_key)?,
        ))
    }

    fn decode_key(s: &str) -> Result<[u8; 32]> {
        let bytes = BASE64
            .decode(s)
            .map_err(|_| CryptoError::InvalidKey)?;
        bytes.try_into().map_err(|_| CryptoError::InvalidKey)
    }
}
