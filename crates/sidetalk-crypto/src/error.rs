//! Error types for Sidetalk crypto

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Authenticated decryption failed: wrong key, or tampered/corrupted
    /// ciphertext. Deliberately carries no detail.
    #[error("decryption failed")]
    Decryption,

    #[error("invalid key material")]
    InvalidKey,

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("key storage error: {0}")]
    KeyStorage(String),
}
