//! Tessera Node
//!
//! Gossip simulator around the consensus engine: generates a hashgraph,
//! feeds it event by event and hands every decided round to a set of sinks.

mod runtime;
mod sink;

pub use runtime::*;
pub use sink::*;
