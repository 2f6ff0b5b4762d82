//! Content encryption using ChaCha20-Poly1305.
//!
//! Immutable files are encrypted under their convergent key. That key is
//! unique to the content (and to the convergence secret and encoding
//! parameters), so a fixed nonce is safe and identical uploads produce
//! identical ciphertext. Mutable files reuse one read key across versions and
//! therefore take a fresh random nonce each time, stored in front of the
//! ciphertext.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::constants::HASH_SIZE;
use crate::error::{GridError, Result};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;

const CONVERGENT_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

/// A 256-bit content encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; HASH_SIZE]);

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey(<redacted>)")
    }
}

impl From<[u8; HASH_SIZE]> for ContentKey {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        ContentKey(bytes)
    }
}

impl ContentKey {
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    /// Deterministic encryption for content-derived keys.
    pub fn encrypt_convergent(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(&CONVERGENT_NONCE), plaintext)
            .map_err(|_| GridError::Crypto("encrypt error".to_string()))
    }

    pub fn decrypt_convergent(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(&CONVERGENT_NONCE), ciphertext)
            .map_err(|_| GridError::Crypto("decrypt error".to_string()))
    }

    /// Encrypts under a random nonce. Output is `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| GridError::Crypto("encrypt error".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(GridError::Crypto("data too short for nonce".to_string()));
        }
        self.cipher()
            .decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
            .map_err(|_| GridError::Crypto("decrypt error".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergent_encryption_is_deterministic() {
        let key = ContentKey::from([3u8; HASH_SIZE]);
        let a = key.encrypt_convergent(b"same bytes").unwrap();
        let b = key.encrypt_convergent(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(key.decrypt_convergent(&a).unwrap(), b"same bytes");
    }

    #[test]
    fn test_random_nonce_encryption() {
        let key = ContentKey::from([4u8; HASH_SIZE]);
        let a = key.encrypt(b"version").unwrap();
        let b = key.encrypt(b"version").unwrap();
        assert_ne!(a, b);
        assert_eq!(key.decrypt(&a).unwrap(), b"version");
    }

    #[test]
    fn test_wrong_key_or_tampering_fails() {
        let key = ContentKey::from([5u8; HASH_SIZE]);
        let mut ciphertext = key.encrypt(b"payload").unwrap();
        assert!(ContentKey::from([6u8; HASH_SIZE]).decrypt(&ciphertext).is_err());

        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert!(key.decrypt(&ciphertext).is_err());
        assert!(key.decrypt(&[0u8; 4]).is_err());
    }
}
