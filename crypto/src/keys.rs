//! Key management for Tessera participants

use ed25519_dalek::{SigningKey as Ed25519SigningKey, VerifyingKey as Ed25519VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tessera_core::{NodeId, PublicKey, TesseraError, TesseraResult};

use crate::hashing::hash_multiple;

/// A keypair for signing and verification
#[derive(Clone)]
pub struct KeyPair {
    signing_key: Ed25519SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create keypair from seed bytes
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Deterministic keypair for a member of a simulated network
    pub fn for_member(network_seed: u64, member: NodeId) -> Self {
        let seed = hash_multiple(&[
            b"tessera-member-key",
            &network_seed.to_le_bytes(),
            &member.to_le_bytes(),
        ]);
        Self::from_seed(seed.as_bytes())
    }

    /// Create keypair from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> TesseraResult<Self> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(TesseraError::InvalidPrivateKey);
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(bytes);
        Ok(Self::from_seed(&seed))
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        let verifying_key = self.signing_key.verifying_key();
        PublicKey::from_bytes(verifying_key.to_bytes())
    }

    /// Get the internal signing key for signing operations
    pub(crate) fn signing_key(&self) -> &Ed25519SigningKey {
        &self.signing_key
    }
}

/// Convert our PublicKey type to Ed25519 verifying key
pub fn public_key_to_ed25519(key: &PublicKey) -> TesseraResult<Ed25519VerifyingKey> {
    Ed25519VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| TesseraError::InvalidPublicKey)
}

/// Serializable public key info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub member: NodeId,
    pub public_key: String,
}

impl PublicKeyInfo {
    pub fn new(member: NodeId, keypair: &KeyPair) -> Self {
        Self {
            member,
            public_key: keypair.public_key().to_hex(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let kp1 = KeyPair::from_seed(&seed);
        let kp2 = KeyPair::from_seed(&seed);

        assert_eq!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn test_member_keys_are_distinct_and_stable() {
        let a = KeyPair::for_member(1, NodeId(0));
        let b = KeyPair::for_member(1, NodeId(1));
        let a_again = KeyPair::for_member(1, NodeId(0));
        let other_network = KeyPair::for_member(2, NodeId(0));

        assert_ne!(a.public_key(), b.public_key());
        assert_eq!(a.public_key(), a_again.public_key());
        assert_ne!(a.public_key(), other_network.public_key());
    }

    #[test]
    fn test_secret_bytes_length() {
        assert!(KeyPair::from_secret_bytes(&[1u8; 31]).is_err());
        assert!(KeyPair::from_secret_bytes(&[1u8; 32]).is_ok());
    }

    #[test]
    fn test_public_key_info() {
        let kp = KeyPair::generate();
        let info = PublicKeyInfo::new(NodeId(5), &kp);
        assert_eq!(info.public_key.len(), 64);
        assert!(public_key_to_ed25519(&kp.public_key()).is_ok());
    }
}
