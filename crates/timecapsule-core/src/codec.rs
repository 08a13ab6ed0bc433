//! Symmetric encryption of stored records.
//!
//! Records are serialized to JSON and sealed with AES-256-GCM under a key
//! derived from the deployment secret. The on-disk envelope is
//! `b"TC1" || nonce(12) || ciphertext || tag(16)`.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MAGIC: &[u8; 3] = b"TC1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors from sealing or opening a record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not an envelope this codec produced.
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),

    /// Authentication failed: wrong key or tampered bytes.
    #[error("integrity check failed (wrong key or corrupted data)")]
    Integrity,

    /// Authentic bytes that do not (de)serialize as the expected record.
    #[error("payload error: {0}")]
    Payload(#[source] serde_json::Error),

    /// The cipher refused to seal the plaintext.
    #[error("encryption failed")]
    Encrypt,
}

/// A 32-byte key that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Encrypts and decrypts serializable records.
#[derive(Debug, Clone)]
pub struct Codec {
    key: DerivedKey,
}

impl Codec {
    /// Derives the key as SHA-256 of `secret`. The same secret yields the
    /// same key on every start.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self {
            key: DerivedKey(key),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key.0))
    }

    /// Serializes and seals `value` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] if `value` does not serialize.
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut plaintext = serde_json::to_vec(value).map_err(CodecError::Payload)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self.cipher().encrypt(&nonce, plaintext.as_slice());
        plaintext.zeroize();
        let sealed = sealed.map_err(|_| CodecError::Encrypt)?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + sealed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens an envelope and deserializes the record.
    ///
    /// # Errors
    ///
    /// [`CodecError::Malformed`] for foreign or truncated input,
    /// [`CodecError::Integrity`] for a wrong key or tampering, and
    /// [`CodecError::Payload`] for authentic bytes of the wrong shape.
    pub fn decrypt<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let rest = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or(CodecError::Malformed("missing header"))?;
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Malformed("truncated"));
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let mut plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::Integrity)?;
        let value = serde_json::from_slice(&plaintext).map_err(CodecError::Payload);
        plaintext.zeroize();
        value
    }
}
