//! Peer public key directory
//!
//! In-memory cache of peer id -> public key, populated by
//! `request_public_key` / `public_key` exchanges over the transport.
//!
//! Keys are accepted trust-on-first-use: any `public_key` frame overwrites
//! the cached value without out-of-band verification. The server is a
//! trusted key-distribution channel in this threat model; a compromised
//! server could substitute keys (see DESIGN.md).

use crate::connection::FrameSender;
use crate::error::{ClientError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sidetalk_types::{ClientFrame, PublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct PublicKeyDirectory {
    cache: Mutex<HashMap<String, PublicKey>>,
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<PublicKey>>>>,
    sender: FrameSender,
    timeout: Duration,
}

impl PublicKeyDirectory {
    pub(crate) fn new(sender: FrameSender, timeout: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            sender,
            timeout,
        }
    }

    /// Synchronous cache lookup, no network
    pub fn get(&self, peer: &str) -> Option<PublicKey> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    /// Cache a peer's key and wake everyone waiting for it
    pub fn put(&self, peer: &str, key: PublicKey) {
        let previous = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string(), key);
        match previous {
            Some(old) if old != key => {
                // Trust-on-first-use: the new key wins, but a changed key is
                // worth noticing in the logs
                warn!(peer, "peer public key changed; replacing cached key");
            }
            _ => debug!(peer, "cached peer public key"),
        }

        let waiters = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(key);
            }
        }
    }

    /// Decode and cache a base64-encoded key from the wire
    pub(crate) fn put_encoded(&self, peer: &str, encoded: &str) -> Result<()> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| ClientError::Crypto(sidetalk_crypto::CryptoError::InvalidKey))?;
        let key: PublicKey = bytes
            .try_into()
            .map_err(|_| ClientError::Crypto(sidetalk_crypto::CryptoError::InvalidKey))?;
        self.put(peer, key);
        Ok(())
    }

    /// Look up a peer's key, requesting it over the transport on a cache
    /// miss
    ///
    /// Bounded by the configured timeout; a miss that times out resolves to
    /// [`ClientError::KeyExchangeTimeout`], never hangs.
    pub async fn resolve(&self, peer: &str) -> Result<PublicKey> {
        if let Some(key) = self.get(peer) {
            return Ok(key);
        }

        // Register the waiter before sending the request so a fast response
        // cannot slip through the gap
        let rx = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let waiters = pending.entry(peer.to_string()).or_default();
            // Waiters whose receivers timed out earlier are dead weight
            waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            rx
        };

        self.sender.send_frame(&ClientFrame::RequestPublicKey {
            recipient_id: peer.to_string(),
        })?;
        debug!(peer, "requested public key");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(key)) => Ok(key),
            // Waiter dropped (disconnect) or timer elapsed: same outcome
            Ok(Err(_)) | Err(_) => {
                warn!(peer, "public key request timed out");
                Err(ClientError::KeyExchangeTimeout {
                    peer: peer.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget key request, used by the inbound path which must
    /// never block on a round trip
    pub(crate) fn request(&self, peer: &str) {
        let result = self.sender.send_frame(&ClientFrame::RequestPublicKey {
            recipient_id: peer.to_string(),
        });
        if result.is_ok() {
            debug!(peer, "requested public key (fire-and-forget)");
        }
    }

    /// Fail every in-flight resolve; called when the transport goes away
    pub(crate) fn fail_pending(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending key requests");
        }
        pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn directory() -> PublicKeyDirectory {
        PublicKeyDirectory::new(FrameSender::new(), Duration::from_millis(100))
    }

    #[test]
    fn get_and_put() {
        let dir = directory();
        assert!(dir.get("bob").is_none());
        dir.put("bob", [1u8; 32]);
        assert_eq!(dir.get("bob"), Some([1u8; 32]));
    }

    #[test]
    fn put_overwrites_trust_on_first_use() {
        let dir = directory();
        dir.put("bob", [1u8; 32]);
        dir.put("bob", [2u8; 32]);
        assert_eq!(dir.get("bob"), Some([2u8; 32]));
    }

    #[test]
    fn put_encoded_rejects_wrong_length() {
        let dir = directory();
        let short = BASE64.encode([0u8; 16]);
        assert!(dir.put_encoded("bob", &short).is_err());
        assert!(dir.get("bob").is_none());
    }

    #[tokio::test]
    async fn resolve_hits_cache_without_transport() {
        // FrameSender has no connection installed, so a cache hit must not
        // touch it
        let dir = directory();
        dir.put("bob", [3u8; 32]);
        assert_eq!(dir.resolve("bob").await.unwrap(), [3u8; 32]);
    }

    #[tokio::test]
    async fn resolve_without_connection_fails_fast() {
        let dir = directory();
        assert!(matches!(
            dir.resolve("bob").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn concurrent_resolves_all_wake_on_put() {
        // Install a live sender so the request frames have somewhere to go
        let sender = FrameSender::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sender.install(tx);
        let dir = Arc::new(PublicKeyDirectory::new(sender, Duration::from_secs(1)));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.resolve("bob").await })
            })
            .collect();

        // Wait for at least one request frame, then answer
        assert!(rx.recv().await.is_some());
        dir.put("bob", [9u8; 32]);

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), [9u8; 32]);
        }
    }

    #[tokio::test]
    async fn resolve_times_out_and_later_retries_do_not_leak() {
        let sender = FrameSender::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        sender.install(tx);
        let dir = PublicKeyDirectory::new(sender, Duration::from_millis(50));

        for _ in 0..3 {
            assert!(matches!(
                dir.resolve("bob").await,
                Err(ClientError::KeyExchangeTimeout { .. })
            ));
        }
        // Dead waiters from the timed-out resolves were pruned on re-entry
        let pending = dir.pending.lock().unwrap();
        assert!(pending.get("bob").map_or(true, |w| w.len() <= 1));
    }
}
