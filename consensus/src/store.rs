//! Event store: the hashgraph arena
//!
//! Events live in a deque of slots addressed by [`EventIndex`]; parents and
//! children are index references. Indices are never reused, so an index held
//! in a memo table either resolves to the event it was created for or to
//! nothing once that event has been evicted. Evicted slots at the front of the
//! deque are released, so the arena only spans the retained window.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tessera_core::{Hash, NodeId, Round, TesseraError, TesseraResult, Timestamp, WeightSource};
use tracing::debug;

use crate::address_book::AddressBook;
use crate::event::{Event, Fame, ParentRef};

/// Position of an event in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventIndex(pub(crate) usize);

impl EventIndex {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// How a declared parent resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    /// No parent declared
    None,
    /// Declared, but ancient and not retained
    Missing,
    /// Declared and present in the arena
    Present(EventIndex),
}

impl ParentLink {
    pub fn index(&self) -> Option<EventIndex> {
        match self {
            ParentLink::Present(idx) => Some(*idx),
            _ => None,
        }
    }

    pub fn is_declared(&self) -> bool {
        !matches!(self, ParentLink::None)
    }
}

/// Append-only consensus decisions about an event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decisions {
    pub round_created: Option<Round>,
    pub is_witness: bool,
    pub fame: Fame,
    pub round_received: Option<Round>,
    pub consensus_timestamp: Option<Timestamp>,
    pub consensus_order: Option<u64>,
    pub last_in_round_received: bool,
    /// Reached consensus before the loaded snapshot was taken
    pub before_snapshot: bool,
    /// Became ancient without reaching consensus
    pub stale: bool,
}

impl Decisions {
    pub fn has_consensus(&self) -> bool {
        self.round_received.is_some() || self.before_snapshot
    }
}

/// An accepted event with its links and decisions
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: Arc<Event>,
    /// Address book index of the creator
    pub member: usize,
    pub self_parent: ParentLink,
    pub other_parent: ParentLink,
    pub children: Vec<EventIndex>,
    pub decisions: Decisions,
}

/// Read-only traversal over the hashgraph
///
/// Round assignment, fame voting and ordering only ever look at the graph
/// through this trait.
pub trait EventGraph {
    fn get(&self, idx: EventIndex) -> Option<&StoredEvent>;

    fn index_of(&self, hash: &Hash) -> Option<EventIndex>;

    fn self_parent(&self, idx: EventIndex) -> Option<EventIndex> {
        self.get(idx)
            .and_then(|e| e.self_parent.index())
            .filter(|p| self.get(*p).is_some())
    }

    fn other_parent(&self, idx: EventIndex) -> Option<EventIndex> {
        self.get(idx)
            .and_then(|e| e.other_parent.index())
            .filter(|p| self.get(*p).is_some())
    }

    fn round_created(&self, idx: EventIndex) -> Option<Round> {
        self.get(idx).and_then(|e| e.decisions.round_created)
    }

    fn generation(&self, idx: EventIndex) -> Option<u64> {
        self.get(idx).map(|e| e.event.generation)
    }

    fn member(&self, idx: EventIndex) -> Option<usize> {
        self.get(idx).map(|e| e.member)
    }

    /// Present parents, self-parent first
    fn parents(&self, idx: EventIndex) -> Vec<EventIndex> {
        self.self_parent(idx)
            .into_iter()
            .chain(self.other_parent(idx))
            .collect()
    }

    /// Every present ancestor of `idx`, excluding `idx` itself
    fn ancestors(&self, idx: EventIndex) -> Vec<EventIndex> {
        let mut seen = HashSet::new();
        let mut stack = self.parents(idx);
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                out.push(next);
                stack.extend(self.parents(next));
            }
        }
        out
    }

    /// Every present descendant of `idx`, excluding `idx` itself
    fn descendants(&self, idx: EventIndex) -> Vec<EventIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<EventIndex> = self
            .get(idx)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if let Some(event) = self.get(next) {
                if seen.insert(next) {
                    out.push(next);
                    stack.extend(event.children.iter().copied());
                }
            }
        }
        out
    }

    /// `a` is `b` or a descendant of `b`
    fn sees(&self, a: EventIndex, b: EventIndex) -> bool {
        let target_generation = match self.generation(b) {
            Some(g) => g,
            None => return false,
        };
        let mut seen = HashSet::new();
        let mut stack = vec![a];
        while let Some(next) = stack.pop() {
            if next == b {
                return true;
            }
            // generations strictly decrease towards the roots
            match self.generation(next) {
                Some(g) if g > target_generation => {}
                _ => continue,
            }
            if seen.insert(next) {
                stack.extend(self.parents(next));
            }
        }
        false
    }

    /// `a` sees `b` through events whose creators hold a supermajority
    fn strongly_sees(&self, a: EventIndex, b: EventIndex, book: &AddressBook) -> bool {
        if !self.sees(a, b) {
            return false;
        }
        let mut creators = HashSet::new();
        for candidate in self.ancestors(a).into_iter().chain(std::iter::once(a)) {
            if self.sees(candidate, b) {
                if let Some(member) = self.member(candidate) {
                    creators.insert(member);
                }
            }
        }
        let weight: u64 = creators.iter().map(|m| book.weight_at(*m)).sum();
        book.is_super_majority(weight)
    }
}

/// Write access to the decision fields of stored events
///
/// Every recorder refuses to overwrite a decision that is already set.
pub trait DecisionRecorder: EventGraph {
    fn record_round(&mut self, idx: EventIndex, round: Round, is_witness: bool) -> TesseraResult<()>;

    fn record_fame(&mut self, idx: EventIndex, fame: Fame) -> TesseraResult<()>;

    fn record_consensus(
        &mut self,
        idx: EventIndex,
        round_received: Round,
        timestamp: Timestamp,
        order: u64,
    ) -> TesseraResult<()>;

    fn mark_last_in_round(&mut self, idx: EventIndex) -> TesseraResult<()>;

    /// Flag an event as ordered before the loaded snapshot
    fn mark_before_snapshot(&mut self, idx: EventIndex) -> TesseraResult<()>;

    /// Flag an event that became ancient without reaching consensus
    fn mark_stale(&mut self, idx: EventIndex) -> TesseraResult<()>;
}

/// The arena
#[derive(Default)]
pub struct EventStore {
    slots: VecDeque<Option<StoredEvent>>,
    /// Index of the front slot
    base: usize,
    by_hash: HashMap<Hash, EventIndex>,
    by_creator: HashMap<NodeId, BTreeMap<u64, Vec<EventIndex>>>,
    by_generation: BTreeMap<u64, Vec<EventIndex>>,
    live: usize,
    /// Parents below this generation may be absent
    ancient_generation: u64,
    /// Per-creator retention floors restored from a snapshot
    creator_floors: HashMap<NodeId, u64>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and link a new event. A rejected event leaves the store untouched.
    pub fn insert(&mut self, event: Arc<Event>, member: usize) -> TesseraResult<EventIndex> {
        let computed = event.compute_hash();
        if computed != event.hash {
            return Err(TesseraError::HashMismatch {
                declared: event.hash,
                computed,
            });
        }

        if self.by_hash.contains_key(&event.hash) {
            return Err(TesseraError::DuplicateEvent(event.hash));
        }

        let self_parent = self.resolve_parent(&event, event.self_parent.as_ref(), Some(event.creator))?;
        let other_parent = self.resolve_parent(&event, event.other_parent.as_ref(), None)?;

        let expected = event.expected_generation();
        if event.generation != expected {
            return Err(TesseraError::GenerationMismatch {
                event: event.hash,
                expected,
                got: event.generation,
            });
        }

        let idx = EventIndex(self.base + self.slots.len());
        for parent in [self_parent, other_parent] {
            if let ParentLink::Present(p) = parent {
                if let Some(stored) = self.slot_mut(p) {
                    stored.children.push(idx);
                }
            }
        }

        self.by_hash.insert(event.hash, idx);
        self.by_creator
            .entry(event.creator)
            .or_default()
            .entry(event.generation)
            .or_default()
            .push(idx);
        self.by_generation.entry(event.generation).or_default().push(idx);

        self.slots.push_back(Some(StoredEvent {
            event,
            member,
            self_parent,
            other_parent,
            children: Vec::new(),
            decisions: Decisions::default(),
        }));
        self.live += 1;

        Ok(idx)
    }

    fn resolve_parent(
        &self,
        event: &Event,
        parent: Option<&ParentRef>,
        creator: Option<NodeId>,
    ) -> TesseraResult<ParentLink> {
        let parent = match parent {
            Some(p) => p,
            None => return Ok(ParentLink::None),
        };

        match self.by_hash.get(&parent.hash) {
            Some(idx) => {
                let actual = self.generation(*idx).unwrap_or_default();
                if actual != parent.generation {
                    return Err(TesseraError::GenerationMismatch {
                        event: event.hash,
                        expected: actual,
                        got: parent.generation,
                    });
                }
                Ok(ParentLink::Present(*idx))
            }
            None if self.allows_missing(parent.generation, creator) => Ok(ParentLink::Missing),
            None => Err(TesseraError::UnknownParent {
                event: event.hash,
                parent: parent.hash,
            }),
        }
    }

    fn allows_missing(&self, generation: u64, creator: Option<NodeId>) -> bool {
        if generation < self.ancient_generation {
            return true;
        }
        creator
            .and_then(|c| self.creator_floors.get(&c))
            .map(|floor| generation < *floor)
            .unwrap_or(false)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots backing the arena, live or not
    pub fn arena_len(&self) -> usize {
        self.slots.len()
    }

    fn slot_mut(&mut self, idx: EventIndex) -> Option<&mut StoredEvent> {
        let offset = idx.0.checked_sub(self.base)?;
        self.slots.get_mut(offset).and_then(Option::as_mut)
    }

    pub fn ancient_generation(&self) -> u64 {
        self.ancient_generation
    }

    /// Raise the floor below which parents may be absent
    pub fn set_ancient_generation(&mut self, generation: u64) {
        self.ancient_generation = self.ancient_generation.max(generation);
    }

    pub fn set_creator_floors(&mut self, floors: impl IntoIterator<Item = (NodeId, u64)>) {
        self.creator_floors = floors.into_iter().collect();
    }

    /// Lowest retained generation of every creator, at or above `min_generation`
    pub fn creator_floors(&self, min_generation: u64) -> BTreeMap<NodeId, u64> {
        self.by_creator
            .iter()
            .filter_map(|(creator, generations)| {
                generations
                    .range(min_generation..)
                    .next()
                    .map(|(g, _)| (*creator, *g))
            })
            .collect()
    }

    pub fn decisions(&self, idx: EventIndex) -> Option<&Decisions> {
        self.get(idx).map(|e| &e.decisions)
    }

    pub fn event(&self, idx: EventIndex) -> Option<&Arc<Event>> {
        self.get(idx).map(|e| &e.event)
    }

    /// Live events in arrival order; parents always precede children
    pub fn indices(&self) -> impl Iterator<Item = EventIndex> + '_ {
        let base = self.base;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(move |(i, _)| EventIndex(base + i))
    }

    /// Events with `from <= generation < to` that have not reached consensus
    /// and are not flagged stale yet
    pub fn pending_between(&self, from: u64, to: u64) -> Vec<EventIndex> {
        if from >= to {
            return Vec::new();
        }
        self.by_generation
            .range(from..to)
            .flat_map(|(_, idxs)| idxs.iter().copied())
            .filter(|idx| {
                self.decisions(*idx)
                    .map(|d| !d.has_consensus() && !d.stale)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn decisions_mut(&mut self, idx: EventIndex) -> TesseraResult<&mut Decisions> {
        self.slot_mut(idx)
            .map(|e| &mut e.decisions)
            .ok_or_else(|| {
                TesseraError::InvariantViolation(format!("event index {} is not live", idx.0))
            })
    }

    /// Drop every event below `generation`; returns the evicted indices
    pub fn evict_below_generation(&mut self, generation: u64) -> Vec<EventIndex> {
        let keep = self.by_generation.split_off(&generation);
        let expired = std::mem::replace(&mut self.by_generation, keep);

        let mut evicted = Vec::new();
        for idx in expired.into_values().flatten() {
            let taken = idx
                .0
                .checked_sub(self.base)
                .and_then(|offset| self.slots.get_mut(offset))
                .and_then(Option::take);
            if let Some(stored) = taken {
                self.by_hash.remove(&stored.event.hash);
                if let Some(generations) = self.by_creator.get_mut(&stored.event.creator) {
                    generations.remove(&stored.event.generation);
                    if generations.is_empty() {
                        self.by_creator.remove(&stored.event.creator);
                    }
                }
                self.live -= 1;
                evicted.push(idx);
            }
        }

        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.base += 1;
        }

        if !evicted.is_empty() {
            debug!(
                "Evicted {} events below generation {}, {} remain",
                evicted.len(),
                generation,
                self.live
            );
        }
        evicted
    }

    /// Forget everything
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl DecisionRecorder for EventStore {
    fn record_round(&mut self, idx: EventIndex, round: Round, is_witness: bool) -> TesseraResult<()> {
        let decisions = self.decisions_mut(idx)?;
        if let Some(existing) = decisions.round_created {
            return Err(TesseraError::InvariantViolation(format!(
                "round of event {} already set to {}, refusing {}",
                idx.0, existing, round
            )));
        }
        decisions.round_created = Some(round);
        decisions.is_witness = is_witness;
        Ok(())
    }

    fn record_fame(&mut self, idx: EventIndex, fame: Fame) -> TesseraResult<()> {
        let decisions = self.decisions_mut(idx)?;
        if !decisions.is_witness {
            return Err(TesseraError::InvariantViolation(format!(
                "fame decided for non-witness event {}",
                idx.0
            )));
        }
        if decisions.fame.is_decided() {
            return Err(TesseraError::InvariantViolation(format!(
                "fame of event {} already decided as {:?}",
                idx.0, decisions.fame
            )));
        }
        decisions.fame = fame;
        Ok(())
    }

    fn record_consensus(
        &mut self,
        idx: EventIndex,
        round_received: Round,
        timestamp: Timestamp,
        order: u64,
    ) -> TesseraResult<()> {
        let decisions = self.decisions_mut(idx)?;
        if decisions.has_consensus() {
            return Err(TesseraError::InvariantViolation(format!(
                "event {} already reached consensus",
                idx.0
            )));
        }
        decisions.round_received = Some(round_received);
        decisions.consensus_timestamp = Some(timestamp);
        decisions.consensus_order = Some(order);
        Ok(())
    }

    fn mark_last_in_round(&mut self, idx: EventIndex) -> TesseraResult<()> {
        self.decisions_mut(idx)?.last_in_round_received = true;
        Ok(())
    }

    fn mark_before_snapshot(&mut self, idx: EventIndex) -> TesseraResult<()> {
        let decisions = self.decisions_mut(idx)?;
        if decisions.round_received.is_none() {
            decisions.before_snapshot = true;
        }
        Ok(())
    }

    fn mark_stale(&mut self, idx: EventIndex) -> TesseraResult<()> {
        let decisions = self.decisions_mut(idx)?;
        if decisions.has_consensus() {
            return Err(TesseraError::InvariantViolation(format!(
                "consensus event {} cannot become stale",
                idx.0
            )));
        }
        decisions.stale = true;
        Ok(())
    }
}

impl EventGraph for EventStore {
    fn get(&self, idx: EventIndex) -> Option<&StoredEvent> {
        let offset = idx.0.checked_sub(self.base)?;
        self.slots.get(offset).and_then(|slot| slot.as_ref())
    }

    fn index_of(&self, hash: &Hash) -> Option<EventIndex> {
        self.by_hash.get(hash).copied()
    }
}
