// ABOUTME: Symmetric authenticated encryption for persisted state, built on ChaCha20-Poly1305.
// ABOUTME: Blobs are framed as base64(nonce || ciphertext || tag) so they fit in a JSON string.

use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_SALT: &[u8] = b"tally-persist/v1";
const KDF_INFO: &[u8] = b"tally state encryption key";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret key must not be empty")]
    EmptySecret,
    #[error("invalid key length; expected 32 bytes")]
    InvalidKeyLength,
    #[error("key derivation failed")]
    DerivationFailed,
    #[error("key source unreadable: {0}")]
    KeySourceUnreadable(String),
    #[error("base64 decoding failed: {0}")]
    Base64DecodeFailed(#[from] base64::DecodeError),
    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    DecryptionFailed,
}

/// A 32-byte symmetric key. The bytes are zeroed when the key is dropped.
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    /// Build a key from exactly 32 raw bytes.
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = key_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { bytes })
    }

    /// Derive a key from a passphrase with HKDF-SHA256. The same passphrase
    /// always yields the same key, so data written by one process can be
    /// read by the next.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptySecret);
        }
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), passphrase.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        hk.expand(KDF_INFO, &mut bytes)
            .map_err(|_| CryptoError::DerivationFailed)?;
        Ok(Self { bytes })
    }

    /// Read a base64-encoded 32-byte key from an environment variable.
    pub fn from_env_var(var: &str) -> Result<Self, CryptoError> {
        let encoded =
            std::env::var(var).map_err(|e| CryptoError::KeySourceUnreadable(format!("{var}: {e}")))?;
        let mut decoded = STANDARD.decode(encoded.trim().as_bytes())?;
        let key = Self::from_key_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Encrypt `plaintext` under a fresh random nonce and return the framed blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    /// Decode and decrypt a blob produced by `encrypt`.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, CryptoError> {
        let framed = STANDARD.decode(blob.trim().as_bytes())?;
        if framed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(framed.len()));
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}
