//! Events and the consensus output built from them

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{Hash, Hashable, NodeId, Round, Signable, Signature, Timestamp};
use tessera_crypto::hashing::IncrementalHasher;
use tessera_state::ConsensusSnapshot;

const EVENT_DOMAIN: &str = "tessera event v1";

/// Reference to a parent event, with the generation the creator saw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub hash: Hash,
    pub generation: u64,
}

impl ParentRef {
    pub fn new(hash: Hash, generation: u64) -> Self {
        Self { hash, generation }
    }

    /// Reference to an existing event
    pub fn of(event: &Event) -> Self {
        Self::new(event.hash, event.generation)
    }
}

/// A node of the hashgraph, as handed over by the gossip layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Creating participant
    pub creator: NodeId,
    /// Previous event by the same creator
    pub self_parent: Option<ParentRef>,
    /// Event by another creator this one synced with
    pub other_parent: Option<ParentRef>,
    /// 1 + max parent generation
    pub generation: u64,
    /// Creator's claimed creation time
    pub time_created: Timestamp,
    /// Opaque transaction payloads
    pub transactions: Vec<Vec<u8>>,
    /// Creator's signature over `hash`
    pub signature: Signature,
    /// Content hash, the event's identity
    pub hash: Hash,
}

impl Event {
    /// Create a new event, computing generation and hash, then signing
    pub fn new(
        creator: NodeId,
        self_parent: Option<ParentRef>,
        other_parent: Option<ParentRef>,
        time_created: Timestamp,
        transactions: Vec<Vec<u8>>,
        sign_fn: impl FnOnce(&Hash) -> Signature,
    ) -> Self {
        let generation = Self::generation_from(self_parent.as_ref(), other_parent.as_ref());
        let mut event = Self {
            creator,
            self_parent,
            other_parent,
            generation,
            time_created,
            transactions,
            signature: Signature::EMPTY,
            hash: Hash::ZERO,
        };
        event.hash = event.compute_hash();
        event.signature = sign_fn(&event.hash);
        event
    }

    /// Generation implied by the declared parents
    pub fn generation_from(self_parent: Option<&ParentRef>, other_parent: Option<&ParentRef>) -> u64 {
        let max_parent = self_parent
            .map(|p| p.generation)
            .into_iter()
            .chain(other_parent.map(|p| p.generation))
            .max();
        match max_parent {
            Some(generation) => generation + 1,
            None => 1,
        }
    }

    /// Generation implied by this event's declared parents
    pub fn expected_generation(&self) -> u64 {
        Self::generation_from(self.self_parent.as_ref(), self.other_parent.as_ref())
    }

    /// Hash over every field except the hash and signature
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = IncrementalHasher::with_domain(EVENT_DOMAIN);
        hasher.update_u64(self.creator.as_u64());
        for parent in [&self.self_parent, &self.other_parent] {
            match parent {
                Some(p) => hasher.update(&[1]).update(p.hash.as_bytes()).update_u64(p.generation),
                None => hasher.update(&[0]),
            };
        }
        hasher
            .update_u64(self.generation)
            .update_u64(self.time_created.as_nanos())
            .update_u64(self.transactions.len() as u64);
        for tx in &self.transactions {
            hasher.update_framed(tx);
        }
        hasher.finalize()
    }

    pub fn has_parents(&self) -> bool {
        self.self_parent.is_some() || self.other_parent.is_some()
    }

    /// Declared parents, self-parent first
    pub fn parents(&self) -> impl Iterator<Item = &ParentRef> {
        self.self_parent.iter().chain(self.other_parent.iter())
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Timestamp of the last transaction when the event is consensus-stamped
    /// at `timestamp`; each transaction takes one microsecond
    pub fn last_transaction_time(&self, timestamp: Timestamp) -> Timestamp {
        let extra = self.transactions.len().saturating_sub(1) as u64;
        timestamp.plus_nanos(extra * Timestamp::NANOS_PER_MICRO)
    }
}

impl Hashable for Event {
    fn hash(&self) -> Hash {
        self.hash
    }
}

impl Signable for Event {
    fn signing_bytes(&self) -> Vec<u8> {
        self.hash.as_bytes().to_vec()
    }
}

/// Fame of a witness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Fame {
    #[default]
    Undecided,
    Famous,
    NotFamous,
}

impl Fame {
    pub fn from_decision(famous: bool) -> Self {
        if famous {
            Fame::Famous
        } else {
            Fame::NotFamous
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, Fame::Undecided)
    }
}

/// An event together with its consensus decisions
#[derive(Debug, Clone)]
pub struct ConsensusEvent {
    pub event: Arc<Event>,
    pub round_created: Round,
    pub round_received: Round,
    pub consensus_timestamp: Timestamp,
    pub consensus_order: u64,
    pub last_in_round_received: bool,
}

impl ConsensusEvent {
    pub fn hash(&self) -> Hash {
        self.event.hash
    }
}

/// A fully ordered round, emitted once its fame is decided
#[derive(Debug, Clone)]
pub struct ConsensusRound {
    /// Round received by every event below
    pub round: Round,
    /// Events in consensus order
    pub events: Vec<ConsensusEvent>,
    /// Judges that decided the round
    pub judges: Vec<Hash>,
    /// Events that became ancient without reaching consensus
    pub stale: Vec<Hash>,
    /// Whether the round was produced while replaying the durable event log
    pub pces_replay: bool,
    /// Checkpoint valid immediately after this round
    pub snapshot: ConsensusSnapshot,
}

impl ConsensusRound {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn hashes(&self) -> Vec<Hash> {
        self.events.iter().map(ConsensusEvent::hash).collect()
    }

    pub fn transaction_count(&self) -> usize {
        self.events.iter().map(|e| e.event.transaction_count()).sum()
    }
}
