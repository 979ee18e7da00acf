// Integration tests for the PeerLink payload encryptions.

use peerlink_crypt::{
    derive_key, Aes256GcmEncryption, ChaCha20Poly1305Encryption, CryptError, MessageEncryption, XorEncryption,
    NONCE_SIZE, TAG_SIZE,
};

fn all() -> Vec<Box<dyn MessageEncryption>> {
    vec![
        Box::new(XorEncryption::from_secret("shared secret").unwrap()),
        Box::new(Aes256GcmEncryption::from_secret("shared secret", b"app").unwrap()),
        Box::new(ChaCha20Poly1305Encryption::from_secret("shared secret", b"app").unwrap()),
    ]
}

// ── Round trips through the trait object ─────────────────────────────────

#[test]
fn every_encryption_restores_payload() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(1500).collect();
    for enc in all() {
        let sealed = enc.encrypt(&payload).unwrap();
        assert_ne!(sealed, payload);
        assert_eq!(enc.decrypt(&sealed).unwrap(), payload);
    }
}

#[test]
fn empty_payload_is_supported() {
    for enc in all() {
        let sealed = enc.encrypt(&[]).unwrap();
        assert!(enc.decrypt(&sealed).unwrap().is_empty());
    }
}

// ── AEAD specifics ───────────────────────────────────────────────────────

#[test]
fn aead_overhead_is_nonce_plus_tag() {
    let aes = Aes256GcmEncryption::from_secret("k", b"app").unwrap();
    let chacha = ChaCha20Poly1305Encryption::from_secret("k", b"app").unwrap();
    assert_eq!(aes.encrypt(b"abcd").unwrap().len(), 4 + NONCE_SIZE + TAG_SIZE);
    assert_eq!(chacha.encrypt(b"abcd").unwrap().len(), 4 + NONCE_SIZE + TAG_SIZE);
}

#[test]
fn different_salt_cannot_decrypt() {
    let a = Aes256GcmEncryption::from_secret("k", b"app one").unwrap();
    let b = Aes256GcmEncryption::from_secret("k", b"app two").unwrap();
    let sealed = a.encrypt(b"payload").unwrap();
    assert!(matches!(b.decrypt(&sealed), Err(CryptError::Decryption(_))));
}

#[test]
fn cipher_suites_do_not_interoperate() {
    let key = *derive_key(b"k", b"app").unwrap();
    let aes = Aes256GcmEncryption::new(key);
    let chacha = ChaCha20Poly1305Encryption::new(key);
    let sealed = aes.encrypt(b"payload").unwrap();
    assert!(chacha.decrypt(&sealed).is_err());
}

#[test]
fn tag_tampering_detected() {
    let chacha = ChaCha20Poly1305Encryption::new([7u8; 32]);
    let mut sealed = chacha.encrypt(b"payload").unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 1;
    assert!(chacha.decrypt(&sealed).is_err());
}
