//! Consensus ordering of the events received in a decided round

use std::collections::{HashMap, HashSet};
use tessera_core::{Hash, Round, TesseraResult, Timestamp};
use tessera_crypto::hashing::xor_fold;

use crate::event::ConsensusEvent;
use crate::store::{DecisionRecorder, EventGraph, EventIndex};

/// Hands out consensus order numbers and timestamps
#[derive(Debug, Clone, Default)]
pub struct OrderingEngine {
    next_order: u64,
    /// Time of the last transaction of the last consensus event
    last_transaction_time: Option<Timestamp>,
}

impl OrderingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume numbering where a snapshot left off
    pub fn restore(next_order: u64, last_transaction_time: Option<Timestamp>) -> Self {
        Self {
            next_order,
            last_transaction_time,
        }
    }

    pub fn next_order(&self) -> u64 {
        self.next_order
    }

    pub fn last_transaction_time(&self) -> Option<Timestamp> {
        self.last_transaction_time
    }

    /// Earliest timestamp the next consensus event may get: one microsecond
    /// after the last transaction, rounded up to a whole microsecond
    pub fn min_next_timestamp(&self) -> Option<Timestamp> {
        self.last_transaction_time.map(|t| {
            t.plus_nanos(Timestamp::NANOS_PER_MICRO)
                .ceil_to(Timestamp::NANOS_PER_MICRO)
        })
    }

    /// Find the events every judge of `round` sees, order them and stamp them
    ///
    /// Events that already have consensus, or are below `ancient_generation`,
    /// are skipped.
    pub fn order_round<S: DecisionRecorder>(
        &mut self,
        store: &mut S,
        round: Round,
        judges: &[EventIndex],
        ancient_generation: u64,
    ) -> TesseraResult<Vec<ConsensusEvent>> {
        if judges.is_empty() {
            return Ok(Vec::new());
        }

        let whitening = whitening(&*store, judges);
        let mut received: Vec<(EventIndex, Timestamp, Hash)> = received_times(&*store, judges, ancient_generation)
            .into_iter()
            .filter(|(_, times)| times.len() == judges.len())
            .filter_map(|(idx, mut times)| {
                times.sort();
                let median = times[times.len() / 2];
                store
                    .get(idx)
                    .map(|e| (idx, median, e.event.hash.xor(&whitening)))
            })
            .collect();
        received.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        let count = received.len();
        let mut out = Vec::with_capacity(count);
        for (position, (idx, median, _)) in received.into_iter().enumerate() {
            let timestamp = match self.min_next_timestamp() {
                Some(min) if min > median => min,
                _ => median,
            };
            let order = self.next_order;
            store.record_consensus(idx, round, timestamp, order)?;
            self.next_order += 1;

            let last = position + 1 == count;
            if last {
                store.mark_last_in_round(idx)?;
            }

            if let Some(stored) = store.get(idx) {
                self.last_transaction_time = Some(stored.event.last_transaction_time(timestamp));
                out.push(ConsensusEvent {
                    event: stored.event.clone(),
                    round_created: stored.decisions.round_created.unwrap_or_default(),
                    round_received: round,
                    consensus_timestamp: timestamp,
                    consensus_order: order,
                    last_in_round_received: last,
                });
            }
        }
        Ok(out)
    }
}

/// XOR of the judges' folded signatures
pub fn whitening<G: EventGraph>(graph: &G, judges: &[EventIndex]) -> Hash {
    judges
        .iter()
        .filter_map(|j| graph.get(*j))
        .fold(Hash::ZERO, |acc, judge| {
            acc.xor(&xor_fold(judge.event.signature.as_bytes()))
        })
}

fn eligible<G: EventGraph>(graph: &G, idx: EventIndex, ancient_generation: u64) -> bool {
    graph
        .get(idx)
        .map(|e| !e.decisions.has_consensus() && e.event.generation >= ancient_generation)
        .unwrap_or(false)
}

/// For each eligible event seen by some judge, the creation times of the
/// earliest self-ancestor of each such judge that sees it
fn received_times<G: EventGraph>(
    graph: &G,
    judges: &[EventIndex],
    ancient_generation: u64,
) -> HashMap<EventIndex, Vec<Timestamp>> {
    let mut times: HashMap<EventIndex, Vec<Timestamp>> = HashMap::new();

    for judge in judges {
        let mut chain = Vec::new();
        let mut cursor = Some(*judge);
        while let Some(idx) = cursor {
            if !eligible(graph, idx, ancient_generation) {
                break;
            }
            chain.push(idx);
            cursor = graph.self_parent(idx);
        }

        let mut visited = HashSet::new();
        for ancestor in chain.iter().rev() {
            let stamp = match graph.get(*ancestor) {
                Some(e) => e.event.time_created,
                None => continue,
            };
            let mut stack = vec![*ancestor];
            while let Some(idx) = stack.pop() {
                if !eligible(graph, idx, ancient_generation) || !visited.insert(idx) {
                    continue;
                }
                times.entry(idx).or_default().push(stamp);
                stack.extend(graph.parents(idx));
            }
        }
    }
    times
}
