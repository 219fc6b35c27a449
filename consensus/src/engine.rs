//! Main consensus engine implementation

use crate::address_book::SharedAddressBook;
use crate::event::{ConsensusRound, Event, Fame};
use crate::fame::FameVoter;
use crate::ordering::OrderingEngine;
use crate::round_engine::RoundEngine;
use crate::rounds::RoundTable;
use crate::snapshot::{build_snapshot, mark_before_snapshot, RestoreState};
use crate::store::{DecisionRecorder, Decisions, EventGraph, EventIndex, EventStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tessera_core::{ConsensusConfig, Hash, Round, TesseraError, TesseraResult, GENERATION_UNDEFINED};
use tessera_state::ConsensusSnapshot;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counters describing the engine's progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusStats {
    /// Events currently retained
    pub events: usize,
    /// Slots backing the event arena
    pub arena_slots: usize,
    /// Events with memoized visibility
    pub memo_entries: usize,
    /// Rounds currently retained
    pub rounds: usize,
    pub max_round: Round,
    pub fame_decided_below: Round,
    /// Order number the next consensus event will get
    pub next_consensus_order: u64,
    pub stale_events: u64,
    pub open_elections: usize,
    pub coin_votes: u64,
    pub ancient_generation: u64,
}

/// Everything guarded by the engine lock
struct ConsensusState {
    config: ConsensusConfig,
    book: SharedAddressBook,
    store: EventStore,
    engine: RoundEngine,
    rounds: RoundTable,
    voter: FameVoter,
    ordering: OrderingEngine,
    restore: Option<RestoreState>,
    stale_events: u64,
}

impl ConsensusState {
    fn new(config: ConsensusConfig, book: SharedAddressBook) -> Self {
        Self {
            engine: RoundEngine::new(book.clone()),
            voter: FameVoter::new(book.clone(), config.coin_freq),
            store: EventStore::new(),
            rounds: RoundTable::new(),
            ordering: OrderingEngine::new(),
            restore: None,
            stale_events: 0,
            config,
            book,
        }
    }

    fn add(&mut self, event: Arc<Event>, pces_replay: bool) -> TesseraResult<Vec<ConsensusRound>> {
        let member = self
            .book
            .index_of(&event.creator)
            .ok_or(TesseraError::UnknownCreator(event.creator))?;
        let idx = self.store.insert(event.clone(), member)?;

        // accepted: from here on every failure is fatal
        let round = self.engine.assign_round(&self.store, idx);
        let is_witness = self.engine.is_witness(&self.store, idx, round);
        self.store.record_round(idx, round, is_witness)?;
        self.engine.complete(&self.store, idx);

        debug!(
            "Event {} by {} (generation {}) is in round {}{}",
            event.hash,
            event.creator,
            event.generation,
            round,
            if is_witness { ", witness" } else { "" }
        );

        self.note_snapshot_judge(idx, &event.hash)?;

        if round >= self.rounds.min_round() {
            self.rounds.note_round(round);
            if self.rounds.create(round - 1) {
                self.voter.on_round_created(round - 1);
            }
            if self.rounds.create(round) {
                debug!("Round {} created", round);
                self.voter.on_round_created(round);
            }
            if is_witness {
                self.voter.register_witness(idx, &mut self.store, &mut self.rounds)?;
                self.voter
                    .vote(idx, &mut self.engine, &mut self.store, &mut self.rounds)?;
            }
        }

        self.process_decided_rounds(pces_replay)
    }

    fn note_snapshot_judge(&mut self, idx: EventIndex, hash: &Hash) -> TesseraResult<()> {
        let judges = match self.restore.as_mut() {
            Some(restore) if restore.is_waiting() => {
                if !restore.note_arrival(idx, hash) {
                    return Ok(());
                }
                restore.arrived.clone()
            }
            _ => return Ok(()),
        };
        mark_before_snapshot(&mut self.store, &judges)?;
        Ok(())
    }

    fn awaiting_snapshot_judges(&self) -> bool {
        self.restore.as_ref().map_or(false, RestoreState::is_waiting)
    }

    fn process_decided_rounds(&mut self, pces_replay: bool) -> TesseraResult<Vec<ConsensusRound>> {
        let mut decided = Vec::new();
        while !self.awaiting_snapshot_judges() {
            match self.rounds.next_decided() {
                Some(round) => decided.push(self.finish_round(round, pces_replay)?),
                None => break,
            }
        }
        Ok(decided)
    }

    /// Order a fame-decided round, then advance the ancient and expiry floors
    fn finish_round(&mut self, round: Round, pces_replay: bool) -> TesseraResult<ConsensusRound> {
        let judges = self
            .rounds
            .get(round)
            .map(|info| info.judge_indices())
            .unwrap_or_default();
        if judges.is_empty() {
            return Err(TesseraError::InvariantViolation(format!(
                "round {} decided without a famous witness",
                round
            )));
        }
        let min_generation = judges.iter().filter_map(|j| self.store.generation(*j)).min();
        if let Some(info) = self.rounds.get_mut(round) {
            info.min_generation = min_generation;
        }

        let previous_ancient = self.store.ancient_generation();
        let events = self
            .ordering
            .order_round(&mut self.store, round, &judges, previous_ancient)?;
        self.rounds.advance();

        let floor_round = round - self.config.rounds_non_ancient as Round + 1;
        let floor = self
            .rounds
            .min_generation(floor_round)
            .unwrap_or(GENERATION_UNDEFINED);
        self.store.set_ancient_generation(floor);

        let stale_indices = self
            .store
            .pending_between(previous_ancient, self.store.ancient_generation());
        let mut stale = Vec::with_capacity(stale_indices.len());
        for idx in stale_indices {
            self.store.mark_stale(idx)?;
            if let Some(event) = self.store.event(idx) {
                stale.push(event.hash);
            }
        }
        self.stale_events += stale.len() as u64;

        self.expire(round);

        let judge_hashes = judges
            .iter()
            .filter_map(|j| self.store.event(*j).map(|e| e.hash))
            .collect();
        let snapshot = build_snapshot(
            &self.store,
            &self.rounds,
            &self.ordering,
            self.config.rounds_non_ancient,
        );

        info!(
            "Round {} reached consensus: {} events, {} judges, {} stale",
            round,
            events.len(),
            judges.len(),
            stale.len()
        );

        Ok(ConsensusRound {
            round,
            events,
            judges: judge_hashes,
            stale,
            pces_replay,
            snapshot,
        })
    }

    /// Forget rounds and events older than the retention window
    fn expire(&mut self, round: Round) {
        let expire_round = round - self.config.rounds_expired as Round + 1;
        let lowest = match self.rounds.span() {
            Some((lowest, _)) => lowest,
            None => return,
        };
        if expire_round <= lowest {
            return;
        }
        if let Some(generation) = self.rounds.min_generation(expire_round) {
            let evicted = self.store.evict_below_generation(generation);
            self.engine.forget(&evicted);
        }
        let dropped = self.rounds.expire_below(expire_round);
        debug!("Expired {} rounds below {}", dropped, expire_round);
    }

    fn load(&mut self, snapshot: ConsensusSnapshot, pces_replay: bool) -> TesseraResult<Vec<ConsensusRound>> {
        snapshot.verify()?;

        let retained: Vec<Arc<Event>> = self
            .store
            .indices()
            .filter_map(|idx| self.store.event(idx))
            .filter(|event| event.generation >= snapshot.ancient_generation)
            .cloned()
            .collect();

        self.store.clear();
        self.engine.clear();
        self.voter.clear();
        self.stale_events = 0;
        self.rounds = RoundTable::restore(&snapshot);
        self.ordering = OrderingEngine::restore(
            snapshot.next_consensus_order,
            snapshot.last_consensus_timestamp,
        );
        self.store.set_ancient_generation(snapshot.ancient_generation);
        self.store
            .set_creator_floors(snapshot.creator_floors.iter().map(|(c, g)| (*c, *g)));
        self.engine
            .seed(snapshot.judges.iter().map(|w| (w.hash, w.round)));
        self.voter
            .seed(snapshot.judges.iter().map(|w| (w.hash, w.famous)));
        self.restore = Some(RestoreState::new(&snapshot));

        info!(
            "Loaded snapshot at round {} ({} witnesses, ancient generation {}), replaying {} retained events",
            snapshot.decided_round(),
            snapshot.judges.len(),
            snapshot.ancient_generation,
            retained.len()
        );

        let mut decided = Vec::new();
        for event in retained {
            match self.add(event, pces_replay) {
                Ok(rounds) => decided.extend(rounds),
                Err(e) if e.is_rejection() => warn!("Dropped retained event after snapshot load: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(decided)
    }

    fn index(&self, hash: &Hash) -> Option<EventIndex> {
        self.store.index_of(hash)
    }

    fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            events: self.store.len(),
            arena_slots: self.store.arena_len(),
            memo_entries: self.engine.memo_len(),
            rounds: self.rounds.len(),
            max_round: self.rounds.max_round(),
            fame_decided_below: self.rounds.fame_decided_below(),
            next_consensus_order: self.ordering.next_order(),
            stale_events: self.stale_events,
            open_elections: self.voter.open_elections(),
            coin_votes: self.voter.coin_votes(),
            ancient_generation: self.store.ancient_generation(),
        }
    }
}

/// Hashgraph consensus engine
///
/// Events are added one at a time under a single lock. The round counters are
/// mirrored in atomics so readers never wait on an insertion.
pub struct Consensus {
    config: ConsensusConfig,
    book: SharedAddressBook,
    state: Mutex<ConsensusState>,
    max_round: AtomicI64,
    fame_decided_below: AtomicI64,
    pces_mode: AtomicBool,
    halted: AtomicBool,
    round_tx: Option<mpsc::Sender<ConsensusRound>>,
}

impl Consensus {
    /// Create a new consensus engine
    pub fn new(config: ConsensusConfig, book: SharedAddressBook) -> TesseraResult<Self> {
        config.validate()?;
        let state = ConsensusState::new(config.clone(), book.clone());
        let (max_round, fame_decided_below) = (state.rounds.max_round(), state.rounds.fame_decided_below());

        Ok(Self {
            config,
            book,
            state: Mutex::new(state),
            max_round: AtomicI64::new(max_round),
            fame_decided_below: AtomicI64::new(fame_decided_below),
            pces_mode: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            round_tx: None,
        })
    }

    /// Also publish every decided round on this channel
    pub fn set_round_channel(&mut self, tx: mpsc::Sender<ConsensusRound>) {
        self.round_tx = Some(tx);
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn address_book(&self) -> &SharedAddressBook {
        &self.book
    }

    /// Add an event and return every round that reached consensus because of it
    ///
    /// Rejected events leave the engine untouched. Any other failure halts the
    /// engine until a snapshot is loaded.
    pub fn add_event(&self, event: Event) -> TesseraResult<Vec<ConsensusRound>> {
        if self.is_halted() {
            return Err(TesseraError::Halted);
        }

        let hash = event.hash;
        let pces_replay = self.is_pces_mode();
        let mut state = self.state.lock();
        let result = state.add(Arc::new(event), pces_replay);
        self.publish(&state);
        drop(state);

        match result {
            Ok(rounds) => {
                for round in &rounds {
                    self.emit_round(round);
                }
                Ok(rounds)
            }
            Err(e) if e.is_rejection() => {
                warn!("Rejected event {}: {}", hash, e);
                Err(e)
            }
            Err(e) => {
                error!("Consensus halted while adding event {}: {}", hash, e);
                self.halted.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Restart consensus from a snapshot
    ///
    /// Retained events at or above the snapshot's ancient generation are
    /// replayed against the restored state; rounds they decide are returned.
    pub fn load_snapshot(&self, snapshot: ConsensusSnapshot) -> TesseraResult<Vec<ConsensusRound>> {
        let pces_replay = self.is_pces_mode();
        let mut state = self.state.lock();
        let result = state.load(snapshot, pces_replay);
        self.publish(&state);
        drop(state);

        match result {
            Ok(rounds) => {
                self.halted.store(false, Ordering::SeqCst);
                for round in &rounds {
                    self.emit_round(round);
                }
                Ok(rounds)
            }
            Err(e) => {
                error!("Snapshot load failed: {}", e);
                self.halted.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn publish(&self, state: &ConsensusState) {
        self.max_round.store(state.rounds.max_round(), Ordering::SeqCst);
        self.fame_decided_below
            .store(state.rounds.fame_decided_below(), Ordering::SeqCst);
    }

    fn emit_round(&self, round: &ConsensusRound) {
        if let Some(tx) = &self.round_tx {
            if let Err(e) = tx.try_send(round.clone()) {
                warn!("Could not publish round {}: {}", round.round, e);
            }
        }
    }

    /// Highest round any event was created in
    pub fn max_round(&self) -> Round {
        self.max_round.load(Ordering::SeqCst)
    }

    /// Every round below this one has reached consensus
    pub fn fame_decided_below(&self) -> Round {
        self.fame_decided_below.load(Ordering::SeqCst)
    }

    /// Rounds emitted from now on are flagged as durable-log replay
    pub fn set_pces_mode(&self, replaying: bool) {
        self.pces_mode.store(replaying, Ordering::SeqCst);
    }

    pub fn is_pces_mode(&self) -> bool {
        self.pces_mode.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.lock().store.contains(hash)
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Consensus decisions about an event
    pub fn decisions(&self, hash: &Hash) -> Option<Decisions> {
        let state = self.state.lock();
        state
            .index(hash)
            .and_then(|idx| state.store.decisions(idx))
            .cloned()
    }

    pub fn round_created(&self, hash: &Hash) -> Option<Round> {
        self.decisions(hash).and_then(|d| d.round_created)
    }

    pub fn fame(&self, hash: &Hash) -> Option<Fame> {
        self.decisions(hash).map(|d| d.fame)
    }

    /// Whether event `a` has `b` as an ancestor, or is `b`
    pub fn sees(&self, a: &Hash, b: &Hash) -> bool {
        let state = self.state.lock();
        match (state.index(a), state.index(b)) {
            (Some(a), Some(b)) => state.store.sees(a, b),
            _ => false,
        }
    }

    pub fn strongly_sees(&self, a: &Hash, b: &Hash) -> bool {
        let state = self.state.lock();
        match (state.index(a), state.index(b)) {
            (Some(a), Some(b)) => state.store.strongly_sees(a, b, &self.book),
            _ => false,
        }
    }

    pub fn ancient_generation(&self) -> u64 {
        self.state.lock().store.ancient_generation()
    }

    pub fn stats(&self) -> ConsensusStats {
        self.state.lock().stats()
    }
}

/// Shared consensus engine
pub type SharedConsensus = Arc<Consensus>;

/// Create the channel decided rounds are published on
pub fn create_round_channel(capacity: usize) -> (mpsc::Sender<ConsensusRound>, mpsc::Receiver<ConsensusRound>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::AddressBook;
    use crate::event::ParentRef;
    use tessera_core::{NodeId, Signature, Timestamp};

    fn engine(members: u64) -> Consensus {
        let book = Arc::new(AddressBook::equal_weights((0..members).map(NodeId)).unwrap());
        Consensus::new(ConsensusConfig::default(), book).unwrap()
    }

    fn genesis(creator: u64) -> Event {
        Event::new(NodeId(creator), None, None, Timestamp::from_millis(creator + 1), vec![], |_| {
            Signature::EMPTY
        })
    }

    #[test]
    fn test_new_engine() {
        let consensus = engine(4);
        assert_eq!(consensus.max_round(), -1);
        assert_eq!(consensus.fame_decided_below(), 1);
        assert_eq!(consensus.event_count(), 0);
        assert!(!consensus.is_halted());
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let book = Arc::new(AddressBook::equal_weights((0..4).map(NodeId)).unwrap());
        let config = ConsensusConfig {
            coin_freq: 0,
            ..Default::default()
        };
        assert!(Consensus::new(config, book).is_err());
    }

    #[test]
    fn test_genesis_round() {
        let consensus = engine(4);
        let event = genesis(0);
        let hash = event.hash;
        assert!(consensus.add_event(event).unwrap().is_empty());
        assert_eq!(consensus.round_created(&hash), Some(1));
        assert_eq!(consensus.fame(&hash), Some(Fame::Undecided));
        assert!(consensus.decisions(&hash).unwrap().is_witness);
        assert_eq!(consensus.max_round(), 1);
    }

    #[test]
    fn test_unknown_creator_is_rejected() {
        let consensus = engine(4);
        let result = consensus.add_event(genesis(9));
        assert!(matches!(result, Err(TesseraError::UnknownCreator(NodeId(9)))));
        assert_eq!(consensus.event_count(), 0);
        assert!(!consensus.is_halted());
    }

    #[test]
    fn test_rejection_does_not_halt() {
        let consensus = engine(4);
        let a = genesis(0);
        consensus.add_event(a.clone()).unwrap();
        assert!(matches!(
            consensus.add_event(a.clone()),
            Err(TesseraError::DuplicateEvent(_))
        ));

        let orphan = Event::new(
            NodeId(1),
            None,
            Some(ParentRef::new(Hash::from_bytes([7; 32]), 3)),
            Timestamp::from_millis(5),
            vec![],
            |_| Signature::EMPTY,
        );
        assert!(matches!(
            consensus.add_event(orphan),
            Err(TesseraError::UnknownParent { .. })
        ));
        assert_eq!(consensus.event_count(), 1);
        assert!(!consensus.is_halted());
        assert!(consensus.add_event(genesis(1)).is_ok());
    }

    #[test]
    fn test_invalid_snapshot_halts() {
        let consensus = engine(4);
        let mut snapshot = ConsensusSnapshot::new(1, vec![], vec![], 0, Default::default(), 0, None);
        snapshot.digest = Hash::ZERO;
        assert!(matches!(
            consensus.load_snapshot(snapshot),
            Err(TesseraError::InvalidSnapshot(_))
        ));
        assert!(consensus.is_halted());
        assert!(matches!(consensus.add_event(genesis(0)), Err(TesseraError::Halted)));
    }
}
