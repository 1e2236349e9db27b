//! Inbound frame dispatch
//!
//! Single entry point for every frame read off the transport. Encrypted
//! `new_message` frames are decrypted here before listeners see them; a
//! message that cannot be decrypted is logged and dropped, never forwarded
//! as garbled plaintext.

use crate::directory::PublicKeyDirectory;
use crate::session::SessionKeys;
use sidetalk_crypto::{decrypt, derive_shared_key, Envelope};
use sidetalk_types::{InboundMessage, MessagePayload, ServerFrame};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// The frame categories listeners can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    AuthenticationResult,
    PublicKey,
    NewMessage,
    Error,
}

impl FrameKind {
    pub fn of(frame: &ServerFrame) -> Self {
        match frame {
            ServerFrame::AuthenticationResult { .. } => FrameKind::AuthenticationResult,
            ServerFrame::PublicKey { .. } => FrameKind::PublicKey,
            ServerFrame::NewMessage { .. } => FrameKind::NewMessage,
            ServerFrame::Error { .. } => FrameKind::Error,
        }
    }
}

pub type FrameListener = Box<dyn Fn(&ServerFrame) + Send + Sync>;

/// Outcome of the authentication handshake, handed to the pending connect
/// operation
#[derive(Debug)]
pub(crate) struct AuthOutcome {
    pub success: bool,
    pub user_id: Option<String>,
}

pub struct MessageRouter {
    listeners: RwLock<HashMap<FrameKind, Vec<FrameListener>>>,
    auth_waiter: Mutex<Option<oneshot::Sender<AuthOutcome>>>,
    directory: Arc<PublicKeyDirectory>,
    keys: Arc<SessionKeys>,
}

impl MessageRouter {
    pub(crate) fn new(directory: Arc<PublicKeyDirectory>, keys: Arc<SessionKeys>) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            auth_waiter: Mutex::new(None),
            directory,
            keys,
        }
    }

    /// Register a listener for one frame kind; multiple listeners per kind
    /// run in registration order
    pub fn on(&self, kind: FrameKind, listener: FrameListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Install the one-shot waiter the connect operation blocks on
    pub(crate) fn set_auth_waiter(&self, tx: oneshot::Sender<AuthOutcome>) {
        *self
            .auth_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Drop any pending auth waiter; its receiver sees a closed channel
    pub(crate) fn drop_auth_waiter(&self) {
        self.auth_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Dispatch one inbound frame
    ///
    /// Runs on the connection's read loop, so frames are handled strictly
    /// in arrival order. Deliberately synchronous: nothing here may wait
    /// on a network round trip, or the loop could never deliver the
    /// response it is waiting for.
    pub(crate) fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::AuthenticationResult { success, user_id } => {
                let waiter = self
                    .auth_waiter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(AuthOutcome {
                            success,
                            user_id: user_id.clone(),
                        });
                    }
                    None => debug!("unsolicited authentication_result"),
                }
                self.emit(&ServerFrame::AuthenticationResult { success, user_id });
            }

            ServerFrame::PublicKey { user_id, public_key } => {
                if let Err(e) = self.directory.put_encoded(&user_id, &public_key) {
                    warn!(peer = %user_id, error = %e, "discarding invalid public key");
                    return;
                }
                self.emit(&ServerFrame::PublicKey { user_id, public_key });
            }

            ServerFrame::NewMessage { message } if message.is_encrypted => {
                match self.decrypt_message(message) {
                    Some(plaintext) => self.emit(&ServerFrame::NewMessage { message: plaintext }),
                    // Undecryptable: dropped from the listener-visible
                    // stream, already logged
                    None => {}
                }
            }
            ServerFrame::NewMessage { message } => {
                self.emit(&ServerFrame::NewMessage { message });
            }

            ServerFrame::Error { code, message } => {
                warn!(code = %code, "server error frame: {message}");
                self.emit(&ServerFrame::Error { code, message });
            }
        }
    }

    /// Decrypt an inbound encrypted message, deriving the sender's shared
    /// key from the directory cache if needed. Any failure drops the
    /// message.
    fn decrypt_message(&self, msg: InboundMessage) -> Option<InboundMessage> {
        let sender = msg.sender_id.clone();

        let key = match self.keys.shared_for(&sender) {
            Some(key) => key,
            None => {
                let local = match self.keys.local_key_pair() {
                    Some(pair) => pair,
                    None => {
                        warn!(peer = %sender, "encrypted message before local keys exist; dropping");
                        return None;
                    }
                };
                let peer_key = match self.directory.get(&sender) {
                    Some(key) => key,
                    None => {
                        // Request the key so a redelivery can succeed, but
                        // never stall the read loop waiting for it
                        self.directory.request(&sender);
                        warn!(peer = %sender, "no public key for sender; dropping message");
                        return None;
                    }
                };
                match derive_shared_key(&local.secret_key, &peer_key) {
                    Ok(key) => {
                        self.keys.cache_shared(&sender, key);
                        key
                    }
                    Err(e) => {
                        warn!(peer = %sender, error = %e, "shared key derivation failed; dropping message");
                        return None;
                    }
                }
            }
        };

        let envelope = match Envelope::from_base64(&msg.content) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %sender, error = %e, "malformed envelope; dropping message");
                return None;
            }
        };
        let plaintext = match decrypt(&envelope, &key) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %sender, error = %e, "decryption failed; dropping message");
                return None;
            }
        };
        let payload: MessagePayload = match serde_json::from_slice(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %sender, error = %e, "invalid payload json; dropping message");
                return None;
            }
        };

        Some(InboundMessage {
            sender_id: msg.sender_id,
            content: payload.content,
            is_encrypted: false,
            content_type: Some(payload.content_type),
            metadata: payload.metadata,
            timestamp: Some(payload.timestamp),
            extra: msg.extra,
        })
    }

    /// Deliver a frame to every listener of its kind, isolating panics so
    /// one broken listener cannot starve the others
    fn emit(&self, frame: &ServerFrame) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(for_kind) = listeners.get(&FrameKind::of(frame)) else {
            return;
        };
        for listener in for_kind {
            if catch_unwind(AssertUnwindSafe(|| listener(frame))).is_err() {
                error!(kind = ?FrameKind::of(frame), "frame listener panicked");
            }
        }
    }
}
