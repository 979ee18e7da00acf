// PeerLink payload encryption
//
// Crate root: the `MessageEncryption` seam and its implementations.

pub mod aead;
pub mod error;
pub mod key;
pub mod xor;

pub use aead::{Aes256GcmEncryption, ChaCha20Poly1305Encryption, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptError, Result};
pub use key::derive_key;
pub use xor::XorEncryption;

/// Reversible transform applied to a message payload.
///
/// Implementations are shared between application threads, so they must
/// not keep per-message state.
pub trait MessageEncryption: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}
