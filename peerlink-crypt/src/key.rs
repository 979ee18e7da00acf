// Passphrase key derivation for the AEAD encryptions.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CryptError, Result};

const KEY_INFO: &[u8] = b"peerlink payload key";

/// Derive a 32-byte key from `secret` with HKDF-SHA256.
///
/// `salt` should be shared by both ends, typically the application
/// identifier. The returned key is wiped when dropped.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_INFO, key.as_mut())
        .map_err(|e| CryptError::InvalidKey(format!("HKDF expand error: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_salted() {
        let a = derive_key(b"passphrase", b"app").unwrap();
        let b = derive_key(b"passphrase", b"app").unwrap();
        let c = derive_key(b"passphrase", b"other app").unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }
}
