// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Symmetric payload encryption.
//!
//! One AEAD format is used both for user file payloads (decrypt side)
//! and for artifacts at rest (both sides):
//!
//! ```text
//! nonce(12) ‖ AES-256-GCM ciphertext+tag
//! ```
//!
//! The cipher key is SHA-256 of the payload key bytes, so callers can
//! hand in key material of any length (the envelope does not constrain
//! it).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::domain::error::ServerError;

const NONCE_LEN: usize = 12;

fn cipher_for(payload_key: &[u8]) -> Aes256Gcm {
    let key = Zeroizing::new(Sha256::digest(payload_key));
    Aes256Gcm::new_from_slice(key.as_slice()).expect("SHA-256 output is a valid AES-256 key")
}

/// Generate a fresh 256-bit payload key.
pub fn generate_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    key
}

/// Encrypt `plaintext` under `payload_key`, producing the wire format.
pub fn encrypt(plaintext: &[u8], payload_key: &[u8]) -> Result<Vec<u8>, ServerError> {
    let cipher = cipher_for(payload_key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ServerError::Internal("payload encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a wire-format payload under `payload_key`. Truncation and
/// authentication failures both map to the opaque decryption error.
pub fn decrypt(data: &[u8], payload_key: &[u8]) -> Result<Vec<u8>, ServerError> {
    if data.len() < NONCE_LEN {
        return Err(ServerError::Decryption);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

    cipher_for(payload_key)
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ServerError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        let encrypted = encrypt(b"hello world", key.as_ref()).unwrap();
        assert_eq!(decrypt(&encrypted, key.as_ref()).unwrap(), b"hello world");
    }

    #[test]
    fn tamper_detected() {
        let key = generate_key();
        let mut encrypted = encrypt(b"hello world", key.as_ref()).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(matches!(
            decrypt(&encrypted, key.as_ref()),
            Err(ServerError::Decryption)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = encrypt(b"hello", generate_key().as_ref()).unwrap();
        assert!(matches!(
            decrypt(&encrypted, generate_key().as_ref()),
            Err(ServerError::Decryption)
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let key = generate_key();
        assert!(matches!(
            decrypt(&[1, 2, 3], key.as_ref()),
            Err(ServerError::Decryption)
        ));
    }

    #[test]
    fn arbitrary_key_lengths_accepted() {
        let encrypted = encrypt(b"data", b"short key").unwrap();
        assert_eq!(decrypt(&encrypted, b"short key").unwrap(), b"data");
    }
}
