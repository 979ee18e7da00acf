// PeerLink crypt error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("ciphertext too short: need at least {need} bytes, have {have}")]
    CiphertextTooShort { need: usize, have: usize },
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, CryptError>;
