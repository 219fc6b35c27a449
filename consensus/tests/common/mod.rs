#![allow(dead_code)]

use std::sync::Arc;
use tessera_consensus::{AddressBook, Consensus, ConsensusRound, Event, GraphGenerator, MemberInfo};
use tessera_core::{ConsensusConfig, Hash, NodeId, Round, Timestamp, Topology};

pub fn ids(n: u64) -> Vec<NodeId> {
    (0..n).map(NodeId).collect()
}

pub fn engine(members: &[(u64, u64)], config: ConsensusConfig) -> Consensus {
    let book = AddressBook::new(
        members
            .iter()
            .map(|(id, weight)| MemberInfo::new(NodeId(*id), *weight))
            .collect(),
    )
    .unwrap();
    Consensus::new(config, Arc::new(book)).unwrap()
}

pub fn equal_engine(n: u64, config: ConsensusConfig) -> Consensus {
    let members: Vec<(u64, u64)> = (0..n).map(|i| (i, 1)).collect();
    engine(&members, config)
}

pub fn round_robin(n: u64, count: usize) -> Vec<Event> {
    GraphGenerator::new(&ids(n), 1, Topology::RoundRobin).generate(count)
}

pub fn random_gossip(n: u64, seed: u64, count: usize) -> Vec<Event> {
    GraphGenerator::new(&ids(n), seed, Topology::RandomGossip)
        .with_transactions(2)
        .generate(count)
}

pub fn feed(consensus: &Consensus, events: &[Event]) -> Vec<ConsensusRound> {
    events
        .iter()
        .flat_map(|e| consensus.add_event(e.clone()).unwrap())
        .collect()
}

/// What two runs must agree on
pub fn summary(rounds: &[ConsensusRound]) -> Vec<(Round, Vec<(Hash, Timestamp, u64)>)> {
    rounds
        .iter()
        .map(|r| {
            (
                r.round,
                r.events
                    .iter()
                    .map(|e| (e.hash(), e.consensus_timestamp, e.consensus_order))
                    .collect(),
            )
        })
        .collect()
}
