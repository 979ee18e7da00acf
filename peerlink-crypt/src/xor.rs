// Cyclic-key XOR obfuscation. Not a cipher: it only hides payloads from
// casual inspection.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptError, Result};
use crate::MessageEncryption;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct XorEncryption {
    key: Vec<u8>,
}

impl XorEncryption {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CryptError::InvalidKey("xor key must not be empty".into()));
        }
        Ok(Self { key })
    }

    /// Key taken from the UTF-8 bytes of `secret`.
    pub fn from_secret(secret: &str) -> Result<Self> {
        Self::new(secret.as_bytes())
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl MessageEncryption for XorEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_applied_cyclically() {
        let xor = XorEncryption::new(vec![0x01, 0x02]).unwrap();
        let out = xor.encrypt(&[0x00, 0x00, 0x00, 0xff]).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x01, 0xfd]);
        assert_eq!(xor.decrypt(&out).unwrap(), vec![0x00, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn empty_key_rejected() {
        assert!(XorEncryption::new(Vec::new()).is_err());
    }
}
