//! Encryption for persisted cache entries

use crate::error::{CacheError, Result};
use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Payloads above this size are encrypted on the blocking pool.
pub const BLOCKING_THRESHOLD_BYTES: usize = 50 * 1024;

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key_bytes: Vec<u8>,
}

impl EncryptionKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CacheError::Encryption(format!(
                "Invalid key length {}. Expected {} bytes for AES-256.",
                bytes.len(),
                KEY_LEN
            )));
        }

        Ok(Self { key_bytes: bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.key_bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| CacheError::Encryption(format!("Invalid hex key: {}", e)))?;

        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}

/// Symmetric encryption capability.
///
/// Kept separate from key storage and data storage so each can be swapped
/// independently (e.g. a hardware-backed cipher on mobile).
pub trait EncryptionProvider: Send + Sync {
    fn generate_key(&self) -> Result<EncryptionKey>;

    fn encrypt(&self, key: &EncryptionKey, plaintext: &[u8]) -> Result<Bytes>;

    fn decrypt(&self, key: &EncryptionKey, ciphertext: &[u8]) -> Result<Bytes>;
}

/// AES-256-GCM with a random 96-bit nonce prepended to the ciphertext.
///
/// Layout: `[nonce (12)][ciphertext][tag (16)]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmEncryption;

impl AesGcmEncryption {
    fn cipher(key: &EncryptionKey) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
    }
}

impl EncryptionProvider for AesGcmEncryption {
    fn generate_key(&self) -> Result<EncryptionKey> {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        EncryptionKey::from_bytes(key.to_vec())
    }

    fn encrypt(&self, key: &EncryptionKey, plaintext: &[u8]) -> Result<Bytes> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = Self::cipher(key)
            .encrypt(nonce, plaintext)
            .map_err(|e| CacheError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(Bytes::from(result))
    }

    fn decrypt(&self, key: &EncryptionKey, ciphertext: &[u8]) -> Result<Bytes> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CacheError::Encryption(
                "Invalid ciphertext: too short".to_string(),
            ));
        }

        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let plaintext = Self::cipher(key)
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CacheError::Encryption(format!("Decryption failed: {}", e)))?;

        Ok(Bytes::from(plaintext))
    }
}

/// Encrypt inline, or on the blocking pool for large payloads.
pub async fn encrypt_payload(
    provider: Arc<dyn EncryptionProvider>,
    key: EncryptionKey,
    plaintext: Vec<u8>,
) -> Result<Bytes> {
    if plaintext.len() <= BLOCKING_THRESHOLD_BYTES {
        return provider.encrypt(&key, &plaintext);
    }

    debug!(bytes = plaintext.len(), "Encrypting large payload off the async workers");
    tokio::task::spawn_blocking(move || provider.encrypt(&key, &plaintext))
        .await
        .map_err(|e| CacheError::Encryption(format!("Encryption task failed: {}", e)))?
}

/// Decrypt inline, or on the blocking pool for large payloads.
pub async fn decrypt_payload(
    provider: Arc<dyn EncryptionProvider>,
    key: EncryptionKey,
    ciphertext: Bytes,
) -> Result<Bytes> {
    if ciphertext.len() <= BLOCKING_THRESHOLD_BYTES {
        return provider.decrypt(&key, &ciphertext);
    }

    debug!(bytes = ciphertext.len(), "Decrypting large payload off the async workers");
    tokio::task::spawn_blocking(move || provider.decrypt(&key, &ciphertext))
        .await
        .map_err(|e| CacheError::Encryption(format!("Decryption task failed: {}", e)))?
}
