// AEAD payload encryption: AES-256-GCM and ChaCha20-Poly1305.
//
// Sealed layout: nonce (12 bytes) || ciphertext || tag (16 bytes).
// A fresh random nonce is drawn for every message.

// Both aes-gcm and chacha20poly1305 re-export the same `aead` traits.
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptError, Result};
use crate::key::derive_key;
use crate::MessageEncryption;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

fn split_sealed(sealed: &[u8]) -> Result<(&[u8; NONCE_SIZE], &[u8])> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptError::CiphertextTooShort {
            need: NONCE_SIZE + TAG_SIZE,
            have: sealed.len(),
        });
    }
    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    let nonce = nonce
        .try_into()
        .map_err(|_| CryptError::Decryption("bad nonce length".into()))?;
    Ok((nonce, body))
}

fn seal(nonce: [u8; NONCE_SIZE], ciphertext: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// AES-256-GCM with a 32-byte key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Aes256GcmEncryption {
    key: [u8; 32],
}

impl Aes256GcmEncryption {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Key derived from a shared passphrase; see [`derive_key`].
    pub fn from_secret(secret: &str, salt: &[u8]) -> Result<Self> {
        Ok(Self::new(*derive_key(secret.as_bytes(), salt)?))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| CryptError::InvalidKey(format!("aes-gcm init: {e}")))
    }
}

impl MessageEncryption for Aes256GcmEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = self
            .cipher()?
            .encrypt(AesNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptError::Encryption(format!("{e}")))?;
        Ok(seal(nonce, ciphertext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, body) = split_sealed(ciphertext)?;
        self.cipher()?
            .decrypt(AesNonce::from_slice(nonce), body)
            .map_err(|e| CryptError::Decryption(format!("{e}")))
    }
}

/// ChaCha20-Poly1305 (RFC 8439) with a 32-byte key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChaCha20Poly1305Encryption {
    key: [u8; 32],
}

impl ChaCha20Poly1305Encryption {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_secret(secret: &str, salt: &[u8]) -> Result<Self> {
        Ok(Self::new(*derive_key(secret.as_bytes(), salt)?))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|e| CryptError::InvalidKey(format!("cipher init: {e}")))
    }
}

impl MessageEncryption for ChaCha20Poly1305Encryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptError::Encryption(format!("{e}")))?;
        Ok(seal(nonce, ciphertext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, body) = split_sealed(ciphertext)?;
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| CryptError::Decryption(format!("{e}")))
    }
}
