//! WebSocket frame protocol
//!
//! One JSON frame per WebSocket text message, discriminated by a `type`
//! field. Field names are camelCase on the wire; the `type` tag is
//! snake_case.

use crate::payload::ContentType;
use serde::{Deserialize, Serialize};

/// Client -> Server frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    // Authentication handshake, sent immediately after the socket opens
    Authenticate {
        token: String,
    },

    // Key distribution
    #[serde(rename_all = "camelCase")]
    RequestPublicKey {
        recipient_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SharePublicKey {
        /// base64-encoded X25519 public key
        public_key: String,
    },

    // Chat
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        thread_id: String,
        recipient_id: String,
        /// base64(nonce ++ ciphertext) when `is_encrypted`
        content: String,
        is_encrypted: bool,
    },
}

/// Server -> Client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    AuthenticationResult {
        success: bool,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PublicKey {
        user_id: String,
        /// base64-encoded X25519 public key
        public_key: String,
    },
    NewMessage {
        message: InboundMessage,
    },
    Error {
        code: String,
        message: String,
    },
}

/// A chat message as delivered by the server
///
/// `extra` preserves any server-side fields this core does not interpret
/// (delivery ids, thread metadata, ...) so listeners see them verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub sender_id: String,
    pub content: String,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
