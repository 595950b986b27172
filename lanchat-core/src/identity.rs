//! Node identity and crypto: keypairs, decimal public values, session keys, text encryption.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Public value of a node (X25519, 32 bytes).
///
/// On the wire it travels as the decimal string of the little-endian integer
/// behind the 32 bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Decimal encoding used in discovery frames.
    pub fn to_decimal(&self) -> String {
        BigUint::from_bytes_le(&self.0).to_str_radix(10)
    }

    /// Parse the decimal encoding. Values that do not fit in 256 bits are rejected.
    pub fn from_decimal(s: &str) -> Result<Self, KeyParseError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyParseError::NotDecimal);
        }
        let n = BigUint::parse_bytes(s.as_bytes(), 10).ok_or(KeyParseError::NotDecimal)?;
        let le = n.to_bytes_le();
        if le.len() > 32 {
            return Err(KeyParseError::OutOfRange);
        }
        let mut out = [0u8; 32];
        out[..le.len()].copy_from_slice(&le);
        Ok(PublicKey(out))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("public value is not a decimal integer")]
    NotDecimal,
    #[error("public value does not fit the key group")]
    OutOfRange,
}

/// X25519 keypair. Keep secret key private; expose only the public value.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Shared secret with another node's public value. Same result from both sides.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Session key for direct traffic with the owner of `other_public`.
    pub fn session_key(&self, other_public: &PublicKey) -> [u8; 32] {
        derive_session_key(&self.shared_secret(other_public))
    }
}

/// Who this node is. Created once at startup and never mutated.
pub struct Identity {
    id: String,
    name: String,
    port: u16,
    keypair: Keypair,
}

impl Identity {
    /// New identity with a random UUID and a fresh keypair.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self::with_keypair(uuid::Uuid::new_v4().to_string(), name, port, Keypair::generate())
    }

    pub fn with_keypair(
        id: impl Into<String>,
        name: impl Into<String>,
        port: u16,
        keypair: Keypair,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port,
            keypair,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Derive a 32-byte session key from a shared secret (ChaCha20-Poly1305 key).
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lanchat-direct-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Encrypt text for a direct frame. Output is base64 of `nonce || ciphertext`,
/// so it never contains the frame delimiter.
pub fn encrypt_text(key: &[u8; 32], plaintext: &str) -> Result<String, WireCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| WireCryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Length of [`encrypt_text`]'s output for a plaintext of `plaintext_len` bytes.
pub fn sealed_len(plaintext_len: usize) -> usize {
    (NONCE_LEN + plaintext_len + TAG_LEN).div_ceil(3) * 4
}

/// Inverse of [`encrypt_text`].
pub fn decrypt_text(key: &[u8; 32], encoded: &str) -> Result<String, WireCryptoError> {
    let raw = BASE64.decode(encoded).map_err(|_| WireCryptoError::Encoding)?;
    if raw.len() < NONCE_LEN {
        return Err(WireCryptoError::Encoding);
    }
    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| WireCryptoError::Decrypt)?;
    String::from_utf8(plain).map_err(|_| WireCryptoError::Encoding)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("ciphertext is not valid base64 or utf-8")]
    Encoding,
}
