//! Sidetalk client
//!
//! The end-to-end encrypted chat transport: a reconnecting WebSocket
//! client that exchanges public keys with peers, derives per-peer shared
//! keys, and transparently encrypts outbound and decrypts inbound chat
//! payloads.
//!
//! The surrounding application supplies an auth token and a key-storage
//! backend, registers frame listeners, and calls
//! [`SecureChatClient::send_message`]; everything else (handshake,
//! key exchange, backoff reconnect) happens inside.

pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod router;
mod session;

pub use client::SecureChatClient;
pub use config::{build_ws_url, ClientConfig, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use directory::PublicKeyDirectory;
pub use error::{ClientError, Result};
pub use router::{FrameKind, FrameListener, MessageRouter};
