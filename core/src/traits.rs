//! Core traits defining Tessera interfaces
//!
//! These traits are the seams between the consensus core and its collaborators.

use crate::types::*;

/// Result type for Tessera operations
pub type TesseraResult<T> = Result<T, crate::error::TesseraError>;

/// Trait for hashable types
pub trait Hashable {
    /// Compute the hash of this object
    fn hash(&self) -> Hash;
}

/// Trait for signable types
pub trait Signable: Hashable {
    /// Get the bytes to be signed
    fn signing_bytes(&self) -> Vec<u8>;
}

/// Stake table consulted by the consensus core
pub trait WeightSource: Send + Sync {
    /// Weight of a participant, `None` if it is not listed
    fn weight_of(&self, id: &NodeId) -> Option<u64>;

    /// Sum of all listed weights
    fn total_weight(&self) -> u64;

    /// Strictly more than two thirds of the total weight
    fn is_super_majority(&self, weight: u64) -> bool {
        is_super_majority(weight, self.total_weight())
    }
}

/// `weight > 2/3 * total`, without rounding
pub fn is_super_majority(weight: u64, total: u64) -> bool {
    (weight as u128) * 3 > (total as u128) * 2
}
