//! Tessera Core Library
//!
//! Core types, errors, configuration and collaborator traits shared by every
//! Tessera crate.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
