//! Tessera Cryptography Module
//!
//! Provides the primitives the consensus core relies on:
//! - BLAKE3 for event identity, whitening and snapshot digests
//! - Ed25519 for event signatures

pub mod keys;
pub mod signing;
pub mod hashing;

pub use keys::*;
pub use signing::*;
pub use hashing::*;
