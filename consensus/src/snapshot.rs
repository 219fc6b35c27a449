//! Taking and restoring consensus snapshots

use std::collections::{HashMap, HashSet};
use tessera_core::{Hash, Round, TesseraResult};
use tessera_state::{ConsensusSnapshot, RoundGeneration, SnapshotWitness, SNAPSHOT_WITNESS_ROUNDS};
use tracing::info;

use crate::event::Fame;
use crate::ordering::OrderingEngine;
use crate::rounds::RoundTable;
use crate::store::{DecisionRecorder, EventGraph, EventIndex, EventStore};

/// Snapshot of the state right after the last decided round
pub fn build_snapshot(
    store: &EventStore,
    rounds: &RoundTable,
    ordering: &OrderingEngine,
    rounds_non_ancient: u64,
) -> ConsensusSnapshot {
    let decided = rounds.fame_decided_below() - 1;
    let lowest_witness_round = decided - SNAPSHOT_WITNESS_ROUNDS + 1;
    let judges = rounds
        .get(decided)
        .map(|info| info.judge_indices())
        .unwrap_or_default();

    let mut witnesses = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = judges.clone();
    while let Some(idx) = stack.pop() {
        let stored = match store.get(idx) {
            Some(e) => e,
            None => continue,
        };
        let round = stored.decisions.round_created.unwrap_or_default();
        if round < lowest_witness_round || !seen.insert(idx) {
            continue;
        }
        let is_judge = round == decided && judges.contains(&idx);
        if is_judge || (round < decided && stored.decisions.is_witness) {
            witnesses.push(SnapshotWitness {
                round,
                creator: stored.event.creator,
                hash: stored.event.hash,
                generation: stored.event.generation,
                famous: stored.decisions.fame == Fame::Famous,
            });
        }
        stack.extend(store.parents(idx));
    }

    let oldest = decided - rounds_non_ancient as Round + 1;
    let round_generations = (oldest..=decided)
        .filter_map(|round| {
            rounds
                .min_generation(round)
                .map(|min_generation| RoundGeneration { round, min_generation })
        })
        .collect();

    let ancient_generation = store.ancient_generation();
    ConsensusSnapshot::new(
        rounds.fame_decided_below(),
        witnesses,
        round_generations,
        ancient_generation,
        store.creator_floors(ancient_generation),
        ordering.next_order(),
        ordering.last_transaction_time(),
    )
}

/// Progress of re-linking a loaded snapshot with incoming events
#[derive(Debug, Clone)]
pub struct RestoreState {
    pub decided_round: Round,
    /// Judges of the decided round not received yet
    pub pending_judges: HashSet<Hash>,
    pub arrived: Vec<EventIndex>,
}

impl RestoreState {
    pub fn new(snapshot: &ConsensusSnapshot) -> Self {
        Self {
            decided_round: snapshot.decided_round(),
            pending_judges: snapshot.last_round_judges().map(|w| w.hash).collect(),
            arrived: Vec::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        !self.pending_judges.is_empty()
    }

    /// Note an arriving event; true once the last judge has arrived
    pub fn note_arrival(&mut self, idx: EventIndex, hash: &Hash) -> bool {
        self.pending_judges.remove(hash) && {
            self.arrived.push(idx);
            self.pending_judges.is_empty()
        }
    }
}

/// Mark every common ancestor of the snapshot judges as already ordered
pub fn mark_before_snapshot<S: DecisionRecorder>(store: &mut S, judges: &[EventIndex]) -> TesseraResult<usize> {
    let mut counts: HashMap<EventIndex, usize> = HashMap::new();
    for judge in judges {
        for idx in store.ancestors(*judge).into_iter().chain(std::iter::once(*judge)) {
            *counts.entry(idx).or_default() += 1;
        }
    }

    let mut marked: Vec<EventIndex> = counts
        .into_iter()
        .filter(|(_, count)| *count == judges.len())
        .map(|(idx, _)| idx)
        .collect();
    marked.sort();
    for idx in &marked {
        store.mark_before_snapshot(*idx)?;
    }

    info!(
        "All {} snapshot judges arrived, {} events predate the snapshot",
        judges.len(),
        marked.len()
    );
    Ok(marked.len())
}
