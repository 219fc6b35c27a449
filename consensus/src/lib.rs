//! Tessera Consensus Engine
//!
//! Hashgraph virtual voting over a DAG of gossip events:
//! - Round assignment from strongly-seen witnesses
//! - Fame elections decided by virtual votes, with coin rounds
//! - Median-timestamp ordering of every round once its fame is decided
//! - Snapshots to restart from a decided round

pub mod address_book;
pub mod engine;
pub mod event;
pub mod fame;
pub mod generator;
pub mod ordering;
pub mod round_engine;
pub mod rounds;
pub mod snapshot;
pub mod store;

pub use address_book::*;
pub use engine::*;
pub use event::*;
pub use generator::{shuffle_topologically, GraphGenerator};
pub use store::{DecisionRecorder, Decisions, EventGraph, EventIndex, EventStore, ParentLink, StoredEvent};
