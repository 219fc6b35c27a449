//! Digital signature operations using Ed25519

use ed25519_dalek::{Signer, Verifier};
use tessera_core::{Hash, PublicKey, Signature, TesseraError, TesseraResult};

use crate::keys::{public_key_to_ed25519, KeyPair};

/// Sign a message using Ed25519
pub fn sign(keypair: &KeyPair, message: &[u8]) -> Signature {
    let signature = keypair.signing_key().sign(message);
    Signature::from_bytes(signature.to_bytes())
}

/// Sign an event or snapshot hash
pub fn sign_hash(keypair: &KeyPair, hash: &Hash) -> Signature {
    sign(keypair, hash.as_bytes())
}

/// Verify a signature using Ed25519
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> TesseraResult<()> {
    let verifying_key = public_key_to_ed25519(public_key)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

    verifying_key
        .verify(message, &sig)
        .map_err(|_| TesseraError::InvalidSignature)
}

/// Check if a signature over a hash is valid
pub fn is_valid_hash_signature(public_key: &PublicKey, hash: &Hash, signature: &Signature) -> bool {
    verify(public_key, hash.as_bytes(), signature).is_ok()
}
