//! Error types for Tessera

use crate::types::{Hash, NodeId};
use thiserror::Error;

/// Main error type for Tessera
#[derive(Error, Debug)]
pub enum TesseraError {
    // ============ Event Rejections ============
    #[error("Duplicate event {0}")]
    DuplicateEvent(Hash),

    #[error("Event {event} references unknown parent {parent}")]
    UnknownParent { event: Hash, parent: Hash },

    #[error("Generation mismatch for event {event}: expected {expected}, got {got}")]
    GenerationMismatch { event: Hash, expected: u64, got: u64 },

    #[error("Event hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: Hash, computed: Hash },

    #[error("Creator {0} is not in the address book")]
    UnknownCreator(NodeId),

    // ============ Consensus Errors ============
    #[error("Consensus invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Consensus halted after a fatal error; load a snapshot to resume")]
    Halted,

    // ============ Cryptography Errors ============
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============ Serialization / IO Errors ============
    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TesseraError {
    /// Structural rejection of an incoming event; state was not touched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TesseraError::DuplicateEvent(_)
                | TesseraError::UnknownParent { .. }
                | TesseraError::GenerationMismatch { .. }
                | TesseraError::HashMismatch { .. }
                | TesseraError::UnknownCreator(_)
        )
    }

    /// Errors after which the engine instance must not continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TesseraError::InvariantViolation(_)
                | TesseraError::InvalidSnapshot(_)
                | TesseraError::Halted
        )
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        TesseraError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(TesseraError::DuplicateEvent(Hash::ZERO).is_rejection());
        assert!(TesseraError::UnknownCreator(NodeId(3)).is_rejection());
        assert!(!TesseraError::DuplicateEvent(Hash::ZERO).is_fatal());

        let fatal = TesseraError::InvariantViolation("round changed".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_rejection());
    }
}
