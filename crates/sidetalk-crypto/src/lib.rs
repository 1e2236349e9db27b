//! Sidetalk crypto
//!
//! X25519 key agreement and XSalsa20-Poly1305 authenticated encryption for
//! the chat transport, plus persistent key-pair storage.
//!
//! Both ends of a conversation derive the same 32-byte shared key from
//! their own secret key and the peer's public key, so either side can
//! encrypt or decrypt independently. Messages travel as
//! `base64(nonce ++ ciphertext)` envelopes with a fresh random 24-byte
//! nonce per encryption.

pub mod engine;
pub mod error;
pub mod keystore;

pub use engine::{
    decrypt, derive_shared_key, encrypt, encrypt_direct, generate_key_pair, Envelope,
};
pub use error::{CryptoError, Result};
pub use keystore::{FileKeyStorage, KeyStorage, KeyStore, MemoryKeyStorage};
