//! Key agreement and authenticated encryption
//!
//! X25519 Diffie-Hellman for the shared secret, HKDF-SHA256 to turn it into
//! a symmetric key, XSalsa20-Poly1305 for the message AEAD. The derivation
//! is commutative: `derive(a_secret, b_public) == derive(b_secret, a_public)`.

use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use sidetalk_types::{KeyPair, Nonce, PublicKey, SecretKey, SharedKey, NONCE_LEN};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use xsalsa20poly1305::aead::Aead;
use xsalsa20poly1305::{KeyInit, XSalsa20Poly1305};

/// Domain separation for shared-key derivation
const SHARED_KEY_CONTEXT: &[u8] = b"sidetalk chat shared key v1";

/// Poly1305 authentication tag length
const TAG_LEN: usize = 16;

/// Wire container for one encrypted message: `nonce ++ ciphertext`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encode as the single base64 string that goes on the wire
    pub fn to_base64(&self) -> String {
        let mut buf = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        BASE64.encode(buf)
    }

    /// Decode from the wire string, splitting at the fixed nonce length
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = BASE64
            .decode(s)
            .map_err(|e| CryptoError::Envelope(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Envelope(format!(
                "too short: {} bytes",
                raw.len()
            )));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Generate a fresh X25519 key pair from the OS CSPRNG
pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    KeyPair::new(*public.as_bytes(), secret.to_bytes())
}

/// Derive the symmetric key shared with a peer
///
/// Pure and deterministic; either party computes the same value. Rejects
/// low-order peer public keys (the DH result would not depend on our
/// secret).
pub fn derive_shared_key(my_secret: &SecretKey, their_public: &PublicKey) -> Result<SharedKey> {
    let secret = StaticSecret::from(*my_secret);
    let public = X25519Public::from(*their_public);
    let dh = secret.diffie_hellman(&public);
    if !dh.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(SHARED_KEY_CONTEXT, &mut key)
        .map_err(|_| CryptoError::Encryption("key derivation failed".to_string()))?;
    Ok(key)
}

/// Encrypt a plaintext under a shared key
///
/// Draws a fresh random nonce from the CSPRNG on every call; nonce reuse
/// under the same key would break the AEAD, so the nonce is never supplied
/// by the caller.
pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<Envelope> {
    let cipher = XSalsa20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = xsalsa20poly1305::Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption("aead encryption failed".to_string()))?;

    Ok(Envelope {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Authenticated decryption of an envelope
///
/// Returns [`CryptoError::Decryption`] when authentication fails; never
/// returns unauthenticated plaintext.
pub fn decrypt(envelope: &Envelope, key: &SharedKey) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(key.into());
    let nonce = xsalsa20poly1305::Nonce::from_slice(&envelope.nonce);

    cipher
        .decrypt(nonce, envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption)
}

/// One-shot derive-and-encrypt, for the first message to a peer before a
/// cached shared key exists
pub fn encrypt_direct(
    plaintext: &[u8],
    my_secret: &SecretKey,
    their_public: &PublicKey,
) -> Result<Envelope> {
    let key = derive_shared_key(my_secret, their_public)?;
    encrypt(plaintext, &key)
}
