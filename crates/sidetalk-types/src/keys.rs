//! Raw key material types

/// X25519 public key (32 bytes)
pub type PublicKey = [u8; 32];

/// X25519 secret key (32 bytes)
pub type SecretKey = [u8; 32];

/// Symmetric key derived from an X25519 agreement (32 bytes)
pub type SharedKey = [u8; 32];

/// XSalsa20 nonce (24 bytes)
pub type Nonce = [u8; 24];

/// Nonce length fixed by the envelope wire format
pub const NONCE_LEN: usize = 24;

/// Key pair for E2E encryption
///
/// The secret key never leaves the device; only `public_key` is ever put
/// on the wire.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

impl KeyPair {
    pub fn new(public_key: PublicKey, secret_key: SecretKey) -> Self {
        Self {
            public_key,
            secret_key,
        }
    }
}

// Deliberately no Debug derive on KeyPair: a derived impl would print the
// secret key into logs.
impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
