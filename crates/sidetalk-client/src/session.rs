//! Per-connection key state
//!
//! The local identity is established when authentication completes; shared
//! keys are derived lazily per peer and cached for the process lifetime
//! (re-derivation after a restart is safe because derivation is
//! deterministic from the stable key pairs).

use sidetalk_types::{KeyPair, SharedKey};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub(crate) struct LocalIdentity {
    pub user_id: String,
    pub key_pair: KeyPair,
}

#[derive(Default)]
pub(crate) struct SessionKeys {
    identity: Mutex<Option<LocalIdentity>>,
    shared: Mutex<HashMap<String, SharedKey>>,
}

impl SessionKeys {
    pub fn set_identity(&self, user_id: &str, key_pair: KeyPair) {
        let mut guard = self
            .identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(LocalIdentity {
            user_id: user_id.to_string(),
            key_pair,
        });
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|identity| identity.user_id.clone())
    }

    pub fn local_key_pair(&self) -> Option<KeyPair> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|identity| identity.key_pair.clone())
    }

    pub fn shared_for(&self, peer: &str) -> Option<SharedKey> {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    pub fn cache_shared(&self, peer: &str, key: SharedKey) {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string(), key);
    }
}
