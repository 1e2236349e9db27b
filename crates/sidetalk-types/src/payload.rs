//! Plaintext message payload
//!
//! This is the JSON structure that gets serialized, encrypted, and wrapped
//! in an envelope before it ever touches the wire.

use serde::{Deserialize, Serialize};

/// Kind of content a chat message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Text
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Text => write!(f, "text"),
            ContentType::Image => write!(f, "image"),
            ContentType::Audio => write!(f, "audio"),
            ContentType::Video => write!(f, "video"),
        }
    }
}

/// The plaintext inside an encrypted envelope
///
/// Only text `content` is end-to-end encrypted; for media messages the
/// `content` field carries a reference (URL) and the media itself is out of
/// scope here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub content: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch, set by the sender
    pub timestamp: i64,
}
