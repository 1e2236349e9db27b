//! The composed secure chat client
//!
//! Owns every piece of state explicitly (no module-level singletons), so
//! multiple independent clients can coexist in one process and tests can
//! build throwaway instances.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, FrameSender};
use crate::directory::PublicKeyDirectory;
use crate::error::{ClientError, Result};
use crate::router::{FrameKind, FrameListener, MessageRouter};
use crate::session::SessionKeys;
use sidetalk_crypto::{derive_shared_key, encrypt, KeyStorage, KeyStore};
use sidetalk_types::{ClientFrame, ContentType, MessagePayload, PublicKey};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// End-to-end encrypted chat transport client
///
/// ```no_run
/// # use sidetalk_client::{ClientConfig, SecureChatClient};
/// # use sidetalk_crypto::FileKeyStorage;
/// # use sidetalk_types::ContentType;
/// # async fn example() -> sidetalk_client::Result<()> {
/// let config = ClientConfig::new("https://chat.example.com");
/// let storage = FileKeyStorage::default_location()?;
/// let client = SecureChatClient::new(config, Box::new(storage));
///
/// client.connect("auth-token").await?;
/// client
///     .send_message("thread-1", "bob", "hello", ContentType::Text, None)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SecureChatClient {
    keystore: Arc<KeyStore>,
    keys: Arc<SessionKeys>,
    directory: Arc<PublicKeyDirectory>,
    router: Arc<MessageRouter>,
    connection: ConnectionManager,
    sender: FrameSender,
}

impl SecureChatClient {
    pub fn new(config: ClientConfig, storage: Box<dyn KeyStorage>) -> Self {
        let sender = FrameSender::new();
        let keystore = Arc::new(KeyStore::new(storage));
        let keys = Arc::new(SessionKeys::default());
        let directory = Arc::new(PublicKeyDirectory::new(
            sender.clone(),
            config.key_request_timeout,
        ));
        let router = Arc::new(MessageRouter::new(directory.clone(), keys.clone()));
        let connection = ConnectionManager::new(
            config,
            sender.clone(),
            router.clone(),
            keystore.clone(),
            keys.clone(),
            directory.clone(),
        );

        Self {
            keystore,
            keys,
            directory,
            router,
            connection,
            sender,
        }
    }

    /// Connect and authenticate; resolves once the server confirms the
    /// token
    pub async fn connect(&self, token: &str) -> Result<()> {
        self.connection.connect(token).await
    }

    /// Tear down the connection and cancel any pending reconnect
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.connection.reconnect_attempts()
    }

    /// Register a listener for inbound frames of one kind
    pub fn on_frame(&self, kind: FrameKind, listener: FrameListener) {
        self.router.on(kind, listener);
    }

    /// The local public key, once authentication has established an
    /// identity
    pub fn local_public_key(&self) -> Option<PublicKey> {
        self.keys.local_key_pair().map(|pair| pair.public_key)
    }

    /// Encrypt and send one chat message
    ///
    /// The full pipeline: connection must be authenticated, local keys
    /// ensured, the recipient's shared key resolved (requesting their
    /// public key over the wire if it is not cached), payload serialized
    /// and encrypted, then exactly one `chat_message` frame transmitted.
    /// Every failure happens before anything is sent; a partial or
    /// corrupt frame never goes out.
    pub async fn send_message(
        &self,
        thread_id: &str,
        recipient_id: &str,
        content: &str,
        content_type: ContentType,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if self.connection.state() != ConnectionState::Authenticated {
            return Err(ClientError::NotConnected);
        }
        let user_id = self.keys.local_user_id().ok_or(ClientError::NotConnected)?;
        let pair = self.keystore.ensure_key_pair(&user_id)?;

        let shared = match self.keys.shared_for(recipient_id) {
            Some(key) => key,
            None => {
                let peer_key = self.directory.resolve(recipient_id).await?;
                let key = derive_shared_key(&pair.secret_key, &peer_key)?;
                self.keys.cache_shared(recipient_id, key);
                key
            }
        };

        let payload = MessagePayload {
            content: content.to_string(),
            content_type,
            metadata,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        let envelope = encrypt(&plaintext, &shared)?;

        self.sender.send_frame(&ClientFrame::ChatMessage {
            thread_id: thread_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: envelope.to_base64(),
            is_encrypted: true,
        })?;
        debug!(thread_id, recipient_id, "sent encrypted message");
        Ok(())
    }
}
