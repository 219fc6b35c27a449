//! Per-round bookkeeping: witnesses, judges and fame progress

use std::collections::BTreeMap;
use tessera_core::{Round, ROUND_FIRST, ROUND_UNDEFINED};
use tessera_state::ConsensusSnapshot;

use crate::store::EventIndex;

/// State of one round
#[derive(Debug, Clone)]
pub struct RoundInfo {
    pub round: Round,
    /// Witnesses in arrival order
    pub witnesses: Vec<EventIndex>,
    /// Famous witnesses, at most one per member (keyed by member index)
    pub judges: BTreeMap<usize, EventIndex>,
    /// Witnesses whose fame is still open
    pub num_unknown_fame: usize,
    pub fame_decided: bool,
    /// Lowest judge generation, known once the round is decided
    pub min_generation: Option<u64>,
    /// Recreated from a snapshot rather than built from events
    pub restored: bool,
}

impl RoundInfo {
    pub fn new(round: Round) -> Self {
        Self {
            round,
            witnesses: Vec::new(),
            judges: BTreeMap::new(),
            num_unknown_fame: 0,
            fame_decided: false,
            min_generation: None,
            restored: false,
        }
    }

    pub fn judge_indices(&self) -> Vec<EventIndex> {
        self.judges.values().copied().collect()
    }
}

/// All retained rounds
#[derive(Debug, Clone)]
pub struct RoundTable {
    rounds: BTreeMap<Round, RoundInfo>,
    /// Every round below this one has decided fame
    fame_decided_below: Round,
    /// Events created below this round are not registered
    min_round: Round,
    max_round: Round,
}

impl Default for RoundTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundTable {
    pub fn new() -> Self {
        Self {
            rounds: BTreeMap::new(),
            fame_decided_below: ROUND_FIRST,
            min_round: ROUND_FIRST,
            max_round: ROUND_UNDEFINED,
        }
    }

    /// Rebuild the decided rounds a snapshot describes, without their events
    pub fn restore(snapshot: &ConsensusSnapshot) -> Self {
        let mut table = Self::new();
        for entry in &snapshot.round_generations {
            let mut info = RoundInfo::new(entry.round);
            info.fame_decided = true;
            info.restored = true;
            info.min_generation = Some(entry.min_generation);
            table.rounds.insert(entry.round, info);
        }
        let decided = snapshot.decided_round();
        table.min_round = table
            .rounds
            .keys()
            .next()
            .copied()
            .unwrap_or(decided)
            .min(decided);
        table.fame_decided_below = snapshot.fame_decided_below;
        table.max_round = decided;
        table
    }

    pub fn get(&self, round: Round) -> Option<&RoundInfo> {
        self.rounds.get(&round)
    }

    pub fn get_mut(&mut self, round: Round) -> Option<&mut RoundInfo> {
        self.rounds.get_mut(&round)
    }

    pub fn contains(&self, round: Round) -> bool {
        self.rounds.contains_key(&round)
    }

    /// Create the round if it does not exist yet; true when created
    pub fn create(&mut self, round: Round) -> bool {
        if round < self.min_round || self.rounds.contains_key(&round) {
            return false;
        }
        self.rounds.insert(round, RoundInfo::new(round));
        self.max_round = self.max_round.max(round);
        true
    }

    pub fn fame_decided_below(&self) -> Round {
        self.fame_decided_below
    }

    pub fn advance(&mut self) {
        self.fame_decided_below += 1;
    }

    /// Next round waiting to be ordered, if its fame is complete
    pub fn next_decided(&self) -> Option<Round> {
        self.rounds
            .get(&self.fame_decided_below)
            .filter(|info| info.fame_decided)
            .map(|info| info.round)
    }

    pub fn min_round(&self) -> Round {
        self.min_round
    }

    pub fn max_round(&self) -> Round {
        self.max_round
    }

    pub fn note_round(&mut self, round: Round) {
        self.max_round = self.max_round.max(round);
    }

    pub fn min_generation(&self, round: Round) -> Option<u64> {
        self.rounds.get(&round).and_then(|info| info.min_generation)
    }

    /// Lowest and highest retained rounds
    pub fn span(&self) -> Option<(Round, Round)> {
        let lowest = *self.rounds.keys().next()?;
        let highest = *self.rounds.keys().next_back()?;
        Some((lowest, highest))
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoundInfo> {
        self.rounds.values()
    }

    /// Drop rounds below `round` and stop registering events created there
    pub fn expire_below(&mut self, round: Round) -> usize {
        let keep = self.rounds.split_off(&round);
        let dropped = std::mem::replace(&mut self.rounds, keep).len();
        self.min_round = self.min_round.max(round);
        dropped
    }
}
