// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blob encryption using ChaCha20-Poly1305 AEAD.
//!
//! Encrypted blob format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`.
//! Keys are derived from plaintext, so encryption never changes a blob's key.

use super::BlobStoreError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Bytes added to every encrypted blob.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Known plaintext stored encrypted next to the blobs to detect a wrong key.
const KEY_CHECK: &[u8] = b"blob-store-key-check";

/// Store-wide symmetric cipher.
#[derive(Clone)]
pub struct BlobCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlobCipher(..)")
    }
}

impl BlobCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BlobStoreError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BlobStoreError::Encryption(format!("encryption failed: {e}")))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BlobStoreError> {
        if data.len() < OVERHEAD {
            return Err(BlobStoreError::Encryption(
                "data too short to contain nonce and tag".to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| BlobStoreError::Encryption(format!("decryption failed: {e}")))
    }

    /// Token written beside the blobs when the store is encrypted.
    pub(crate) fn key_check(&self) -> Result<Vec<u8>, BlobStoreError> {
        self.encrypt(KEY_CHECK)
    }

    /// Whether `token` was produced by [`key_check`](Self::key_check) with this key.
    pub(crate) fn verify_key_check(&self, token: &[u8]) -> bool {
        self.decrypt(token).is_ok_and(|plain| plain == KEY_CHECK)
    }
}
