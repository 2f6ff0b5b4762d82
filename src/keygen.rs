use std::sync::atomic::{AtomicUsize, Ordering};

use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::DEFAULT_KEYSIZE;
use crate::error::{GridError, Result};

/// Public half of a mutable file keypair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyingKey(RsaPublicKey);

/// Private half of a mutable file keypair.
#[derive(Clone)]
pub struct SigningKey(RsaPrivateKey);

impl VerifyingKey {
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .0
            .to_pkcs1_der()
            .map_err(|e| GridError::Crypto(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        RsaPublicKey::from_pkcs1_der(der)
            .map(VerifyingKey)
            .map_err(|e| GridError::Crypto(e.to_string()))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let digest = Sha256::digest(message);
        self.0
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|e| GridError::Crypto(e.to_string()))
    }
}

impl SigningKey {
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.to_public_key())
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .0
            .to_pkcs1_der()
            .map_err(|e| GridError::Crypto(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        RsaPrivateKey::from_pkcs1_der(der)
            .map(SigningKey)
            .map_err(|e| GridError::Crypto(e.to_string()))
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(message);
        self.0
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| GridError::Crypto(e.to_string()))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(<redacted>)")
    }
}

/// Creates RSA keypairs for new mutable files.
///
/// The key size comes from the `bits` argument to [`KeyGenerator::generate`],
/// then from [`KeyGenerator::set_default_strength`], then from the built-in
/// 2048-bit default. Tests lower the default once during setup so they run fast.
#[derive(Debug)]
pub struct KeyGenerator {
    default_bits: AtomicUsize,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        KeyGenerator {
            default_bits: AtomicUsize::new(DEFAULT_KEYSIZE),
        }
    }
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_strength(&self, bits: usize) {
        self.default_bits.store(bits, Ordering::Relaxed);
    }

    pub fn default_strength(&self) -> usize {
        self.default_bits.load(Ordering::Relaxed)
    }

    /// Generates a keypair off the async executor; a 2048-bit key takes on the
    /// order of a second.
    pub async fn generate(&self, bits: Option<usize>) -> Result<(VerifyingKey, SigningKey)> {
        let bits = bits.unwrap_or_else(|| self.default_strength());
        debug!("generating {bits}-bit mutable file key");
        let private = tokio::task::spawn_blocking(move || {
            RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        })
        .await
        .map_err(|e| GridError::KeyGeneration(e.to_string()))?
        .map_err(|e| GridError::KeyGeneration(e.to_string()))?;
        let signing = SigningKey(private);
        Ok((signing.verifying_key(), signing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    #[tokio::test]
    async fn test_generate_uses_default_strength() {
        let keygen = KeyGenerator::new();
        assert_eq!(keygen.default_strength(), DEFAULT_KEYSIZE);

        keygen.set_default_strength(768);
        let (verifying, _) = keygen.generate(None).await.unwrap();
        assert_eq!(verifying.0.size() * 8, 768);
    }

    #[tokio::test]
    async fn test_explicit_strength_overrides_default() {
        let keygen = KeyGenerator::new();
        keygen.set_default_strength(768);
        let (verifying, _) = keygen.generate(Some(1024)).await.unwrap();
        assert_eq!(verifying.0.size() * 8, 1024);
    }

    #[tokio::test]
    async fn test_sign_verify_and_der_round_trip() {
        let keygen = KeyGenerator::new();
        let (verifying, signing) = keygen.generate(Some(768)).await.unwrap();

        let signature = signing.sign(b"version 1").unwrap();
        verifying.verify(b"version 1", &signature).unwrap();
        assert!(verifying.verify(b"version 2", &signature).is_err());

        let restored = SigningKey::from_der(&signing.to_der().unwrap()).unwrap();
        assert_eq!(restored.verifying_key(), verifying);
        let public = VerifyingKey::from_der(&verifying.to_der().unwrap()).unwrap();
        assert_eq!(public, verifying);
    }
}
