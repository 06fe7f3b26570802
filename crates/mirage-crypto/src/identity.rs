//! Identity key generation, fingerprints, and hello-envelope signatures.
//!
//! Each Mirage endpoint has a long-term Ed25519 identity key pair generated
//! on first launch and persisted across sessions. Peers refer to each other
//! by the SHA-256 fingerprint of the public key.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// SHA-256 fingerprint of an identity public key.
pub type KeyId = [u8; 32];

/// Compute the key id (fingerprint) of a raw Ed25519 public key.
pub fn key_id_of(public_key: &[u8]) -> KeyId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    id
}

/// A long-term Ed25519 identity key pair.
///
/// The PKCS#8 document is retained so the pair can be serialized for
/// persistence; ring's key type itself is opaque.
pub struct IdentityKeyPair {
    pkcs8: Zeroizing<Vec<u8>>,
    key: Ed25519KeyPair,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| CryptoError::Rng)?;
        let key = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| CryptoError::KeyMaterial("generated pkcs8 did not parse"))?;
        Ok(Self {
            pkcs8: Zeroizing::new(pkcs8.as_ref().to_vec()),
            key,
        })
    }

    /// Reconstruct a key pair from a stored PKCS#8 document.
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, CryptoError> {
        let key = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|_| CryptoError::KeyMaterial("invalid pkcs8 identity key"))?;
        Ok(Self {
            pkcs8: Zeroizing::new(pkcs8.to_vec()),
            key,
        })
    }

    /// 32-byte Ed25519 public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.key.public_key().as_ref().to_vec()
    }

    /// Fingerprint of the public key.
    pub fn key_id(&self) -> KeyId {
        key_id_of(self.key.public_key().as_ref())
    }

    /// Sign a canonical payload. Returns the 64-byte signature.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key.sign(payload).as_ref().to_vec()
    }

    /// Serializable form for persistence.
    pub fn to_stored(&self) -> StoredIdentityKeyPair {
        StoredIdentityKeyPair {
            pkcs8: self.pkcs8.to_vec(),
        }
    }
}

/// Verify an Ed25519 signature over a canonical payload.
pub fn verify(public_key: &[u8], payload: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(payload, signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// Verify that a claimed key id matches the public key it names.
pub fn verify_key_id(key_id: &KeyId, public_key: &[u8]) -> Result<(), CryptoError> {
    if key_id_of(public_key) != *key_id {
        return Err(CryptoError::KeyIdMismatch);
    }
    Ok(())
}

/// A serializable wrapper around the identity key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredIdentityKeyPair {
    /// PKCS#8 v2 document holding both halves of the Ed25519 pair.
    pub pkcs8: Vec<u8>,
}

impl StoredIdentityKeyPair {
    pub fn to_key_pair(&self) -> Result<IdentityKeyPair, CryptoError> {
        IdentityKeyPair::from_pkcs8(&self.pkcs8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = IdentityKeyPair::generate().unwrap();
        let stored = pair.to_stored();
        let restored = stored.to_key_pair().unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
        assert_eq!(pair.key_id(), restored.key_id());
    }

    #[test]
    fn sign_and_verify() {
        let pair = IdentityKeyPair::generate().unwrap();
        let payload = b"canonical hello payload";
        let sig = pair.sign(payload);
        verify(&pair.public_key(), payload, &sig).unwrap();
    }

    #[test]
    fn tampered_payload_rejected() {
        let pair = IdentityKeyPair::generate().unwrap();
        let sig = pair.sign(b"payload");
        assert!(matches!(
            verify(&pair.public_key(), b"payloae", &sig),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn foreign_key_rejected() {
        let pair = IdentityKeyPair::generate().unwrap();
        let other = IdentityKeyPair::generate().unwrap();
        let sig = pair.sign(b"payload");
        assert!(verify(&other.public_key(), b"payload", &sig).is_err());
    }

    #[test]
    fn key_id_matches_fingerprint() {
        let pair = IdentityKeyPair::generate().unwrap();
        verify_key_id(&pair.key_id(), &pair.public_key()).unwrap();

        let mut wrong = pair.key_id();
        wrong[0] ^= 0xFF;
        assert!(matches!(
            verify_key_id(&wrong, &pair.public_key()),
            Err(CryptoError::KeyIdMismatch)
        ));
    }
}
