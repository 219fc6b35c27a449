//! Deterministic hashgraph generator
//!
//! Produces signed events for a set of members following a gossip topology.
//! Used by the simulator and by tests that need realistic graphs.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tessera_core::{Hash, NodeId, SimulationConfig, Timestamp, Topology};
use tessera_crypto::keys::KeyPair;
use tessera_crypto::signing::sign_hash;

use crate::event::{Event, ParentRef};

/// Event factory for a simulated network
pub struct GraphGenerator {
    members: Vec<(NodeId, KeyPair)>,
    /// Latest event of each member
    latest: Vec<Option<ParentRef>>,
    /// Most recent event overall
    last: Option<ParentRef>,
    topology: Topology,
    rng: StdRng,
    clock: Timestamp,
    step_nanos: u64,
    transactions_per_event: usize,
    turn: usize,
    created: u64,
}

impl GraphGenerator {
    pub fn new(ids: &[NodeId], seed: u64, topology: Topology) -> Self {
        Self {
            members: ids
                .iter()
                .map(|id| (*id, KeyPair::for_member(seed, *id)))
                .collect(),
            latest: vec![None; ids.len()],
            last: None,
            topology,
            rng: StdRng::seed_from_u64(seed),
            clock: Timestamp::from_nanos(0),
            step_nanos: Timestamp::NANOS_PER_MILLI,
            transactions_per_event: 0,
            turn: 0,
            created: 0,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        let ids: Vec<NodeId> = config.members.iter().map(|m| m.id).collect();
        Self::new(&ids, config.seed, config.topology)
            .with_step_millis(config.step_millis)
            .with_transactions(config.transactions_per_event)
    }

    pub fn with_step_millis(mut self, millis: u64) -> Self {
        self.step_nanos = millis.max(1) * Timestamp::NANOS_PER_MILLI;
        self
    }

    pub fn with_transactions(mut self, per_event: usize) -> Self {
        self.transactions_per_event = per_event;
        self
    }

    /// Key pair of a member
    pub fn key_pair(&self, id: &NodeId) -> Option<&KeyPair> {
        self.members.iter().find(|(m, _)| m == id).map(|(_, kp)| kp)
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// Create the next event
    ///
    /// Every member starts with a genesis event, in member order.
    pub fn next_event(&mut self) -> Event {
        let n = self.members.len();
        let creator = match self.latest.iter().position(Option::is_none) {
            Some(index) => index,
            None => self.pick_creator(n),
        };
        let other_parent = if self.latest[creator].is_none() {
            None
        } else {
            self.pick_other_parent(creator, n)
        };

        let jitter = match self.topology {
            Topology::RandomGossip => self.rng.gen_range(0..self.step_nanos),
            Topology::RoundRobin => 0,
        };
        self.clock = self.clock.plus_nanos(self.step_nanos + jitter);

        let (id, key_pair) = &self.members[creator];
        let transactions = (0..self.transactions_per_event)
            .map(|i| format!("{}:{}:{}", id.as_u64(), self.created, i).into_bytes())
            .collect();
        let event = Event::new(
            *id,
            self.latest[creator],
            other_parent,
            self.clock,
            transactions,
            |hash| sign_hash(key_pair, hash),
        );

        let reference = ParentRef::of(&event);
        self.latest[creator] = Some(reference);
        self.last = Some(reference);
        self.created += 1;
        event
    }

    fn pick_creator(&mut self, n: usize) -> usize {
        match self.topology {
            Topology::RoundRobin => {
                let creator = self.turn % n;
                self.turn += 1;
                creator
            }
            Topology::RandomGossip => self.rng.gen_range(0..n),
        }
    }

    fn pick_other_parent(&mut self, creator: usize, n: usize) -> Option<ParentRef> {
        match self.topology {
            Topology::RoundRobin => self.last,
            Topology::RandomGossip => {
                let offset = self.rng.gen_range(1..n);
                self.latest[(creator + offset) % n]
            }
        }
    }

    pub fn generate(&mut self, count: usize) -> Vec<Event> {
        (0..count).map(|_| self.next_event()).collect()
    }
}

/// A random order of `events` in which every parent still precedes its children
pub fn shuffle_topologically(events: &[Event], seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let known: HashSet<Hash> = events.iter().map(|e| e.hash).collect();
    let mut emitted: HashSet<Hash> = HashSet::with_capacity(events.len());
    let mut remaining: Vec<&Event> = events.iter().collect();
    let mut out = Vec::with_capacity(events.len());

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.parents()
                    .all(|p| emitted.contains(&p.hash) || !known.contains(&p.hash))
            })
            .map(|(i, _)| i)
            .collect();
        let pick = match ready.choose(&mut rng) {
            Some(i) => *i,
            None => break,
        };
        let event = remaining.swap_remove(pick);
        emitted.insert(event.hash);
        out.push(event.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_crypto::signing::is_valid_hash_signature;

    fn ids(n: u64) -> Vec<NodeId> {
        (0..n).map(NodeId).collect()
    }

    #[test]
    fn test_genesis_first_then_round_robin() {
        let mut generator = GraphGenerator::new(&ids(4), 1, Topology::RoundRobin);
        let events = generator.generate(10);

        for (i, event) in events.iter().take(4).enumerate() {
            assert_eq!(event.creator, NodeId(i as u64));
            assert!(!event.has_parents());
        }
        assert_eq!(events[4].creator, NodeId(0));
        assert_eq!(events[4].self_parent, Some(ParentRef::of(&events[0])));
        assert_eq!(events[4].other_parent, Some(ParentRef::of(&events[3])));
        assert_eq!(events[5].creator, NodeId(1));
        assert_eq!(events[5].other_parent, Some(ParentRef::of(&events[4])));
        assert_eq!(events[9].generation, 7);
        assert_eq!(events[4].time_created, Timestamp::from_millis(5));
    }

    #[test]
    fn test_events_are_signed_and_timed() {
        let mut generator = GraphGenerator::new(&ids(4), 3, Topology::RandomGossip).with_transactions(2);
        let events = generator.generate(50);
        for pair in events.windows(2) {
            assert!(pair[0].time_created < pair[1].time_created);
        }
        for event in &events {
            assert_eq!(event.transactions.len(), 2);
            let key_pair = generator.key_pair(&event.creator).unwrap();
            assert!(is_valid_hash_signature(&key_pair.public_key(), &event.hash, &event.signature));
            if let Some(other) = &event.other_parent {
                let parent = events.iter().find(|e| e.hash == other.hash).unwrap();
                assert_ne!(parent.creator, event.creator);
            }
        }
    }

    #[test]
    fn test_same_seed_same_graph() {
        let a = GraphGenerator::new(&ids(5), 11, Topology::RandomGossip).generate(40);
        let b = GraphGenerator::new(&ids(5), 11, Topology::RandomGossip).generate(40);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shuffle_keeps_parents_first() {
        let events = GraphGenerator::new(&ids(4), 5, Topology::RandomGossip).generate(60);
        let shuffled = shuffle_topologically(&events, 9);
        assert_eq!(shuffled.len(), events.len());

        let mut seen = HashSet::new();
        for event in &shuffled {
            for parent in event.parents() {
                assert!(seen.contains(&parent.hash));
            }
            seen.insert(event.hash);
        }
    }
}
