//! Error types for the chat client

use sidetalk_crypto::CryptoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Operation attempted while the connection is not authenticated
    #[error("not connected")]
    NotConnected,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server never answered the authentication handshake
    #[error("timed out waiting for authentication")]
    ConnectTimeout,

    /// The peer's public key did not arrive within the request timeout
    #[error("public key request for {peer} timed out")]
    KeyExchangeTimeout { peer: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
