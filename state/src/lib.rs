//! Tessera State Management
//!
//! Snapshots of consensus state: the minimal checkpoint needed to resume
//! ordering after a restart or reconnect, plus a bounded history of them.

pub mod snapshot;

pub use snapshot::*;
