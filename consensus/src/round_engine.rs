//! Round assignment
//!
//! Every query here is answered from memo tables filled in when an event is
//! inserted. The tables of an event only refer to the tables of its parents,
//! so each insertion costs `O(n^2)` lookups for `n` members and recursion never
//! goes deeper than one level.

use std::collections::HashMap;
use tessera_core::{Hash, Round, WeightSource, ROUND_FIRST, ROUND_NEGATIVE_INFINITY};

use crate::address_book::SharedAddressBook;
use crate::store::{EventGraph, EventIndex};

/// Per-event visibility memo
#[derive(Debug, Default, Clone)]
struct Visibility {
    /// Latest event by each member that this event sees
    last_see: Option<Vec<Option<EventIndex>>>,
    /// Witness by each member in the parent round that this event strongly sees
    strongly_see_p: Option<Vec<Option<EventIndex>>>,
    /// Earliest self-ancestor in the same round
    first_self_witness: Option<Option<EventIndex>>,
    /// First witness in the same round seen along the parents
    first_witness: Option<Option<EventIndex>>,
}

/// Round engine
pub struct RoundEngine {
    book: SharedAddressBook,
    memo: HashMap<EventIndex, Visibility>,
    /// Rounds imposed by a loaded snapshot
    seeded: HashMap<Hash, Round>,
}

impl RoundEngine {
    pub fn new(book: SharedAddressBook) -> Self {
        Self {
            book,
            memo: HashMap::new(),
            seeded: HashMap::new(),
        }
    }

    /// Impose rounds on specific events, regardless of their parents
    pub fn seed(&mut self, rounds: impl IntoIterator<Item = (Hash, Round)>) {
        self.seeded.extend(rounds);
    }

    pub fn is_seeded(&self, hash: &Hash) -> bool {
        self.seeded.contains_key(hash)
    }

    /// Drop every memo and seeded round
    pub fn clear(&mut self) {
        self.memo.clear();
        self.seeded.clear();
    }

    /// Drop the memo of evicted events
    pub fn forget(&mut self, evicted: &[EventIndex]) {
        for idx in evicted {
            self.memo.remove(idx);
        }
    }

    /// Events with a memo entry
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    fn cached(&self, x: EventIndex) -> Option<&Visibility> {
        self.memo.get(&x)
    }

    fn slot(&mut self, x: EventIndex) -> &mut Visibility {
        self.memo.entry(x).or_default()
    }

    /// Compute the round of a freshly inserted event
    ///
    /// Must be followed by recording the round in the store and then
    /// [`RoundEngine::complete`].
    pub fn assign_round<G: EventGraph>(&mut self, g: &G, x: EventIndex) -> Round {
        // fills the whole last_see table; no member has this index
        self.last_see(g, Some(x), usize::MAX);

        let event = match g.get(x) {
            Some(stored) => stored.event.clone(),
            None => return ROUND_NEGATIVE_INFINITY,
        };

        if let Some(round) = self.seeded.get(&event.hash) {
            return *round;
        }
        if !event.has_parents() {
            return ROUND_FIRST;
        }

        let self_round = self.round_of(g, g.self_parent(x));
        let other_round = self.round_of(g, g.other_parent(x));
        if self_round <= 0 && other_round <= 0 {
            return ROUND_NEGATIVE_INFINITY;
        }
        if self_round != other_round {
            return self_round.max(other_round);
        }

        let mut weight: u64 = 0;
        for m in 0..self.book.len() {
            if self.strongly_see_p(g, Some(x), m).is_some() {
                weight += self.book.weight_at(m);
            }
        }

        if self.book.is_super_majority(weight) {
            self_round + 1
        } else {
            self_round
        }
    }

    /// Fill the memo entries that need the event's own round
    pub fn complete<G: EventGraph>(&mut self, g: &G, x: EventIndex) {
        self.first_self_witness(g, Some(x));
        self.first_witness(g, Some(x));
    }

    /// Whether an event of round `round` would be a witness
    pub fn is_witness<G: EventGraph>(&self, g: &G, x: EventIndex, round: Round) -> bool {
        round > 0 && round > self.round_of(g, g.self_parent(x))
    }

    /// Round of an event; zero for nothing or an evicted event
    pub fn round_of<G: EventGraph>(&self, g: &G, x: Option<EventIndex>) -> Round {
        x.and_then(|i| g.round_created(i)).unwrap_or(0)
    }

    /// Highest round among the present parents
    pub fn parent_round<G: EventGraph>(&self, g: &G, x: EventIndex) -> Round {
        self.round_of(g, g.self_parent(x))
            .max(self.round_of(g, g.other_parent(x)))
    }

    /// Latest ancestor of `x` created by member `m`
    pub fn last_see<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>, m: usize) -> Option<EventIndex> {
        let x = x?;
        let member = g.member(x)?;
        if member == m {
            return Some(x);
        }
        if let Some(table) = self.cached(x).and_then(|v| v.last_see.as_ref()) {
            return table.get(m).copied().flatten();
        }

        let self_parent = g.self_parent(x);
        let other_parent = g.other_parent(x);
        let mut table = Vec::with_capacity(self.book.len());
        for mm in 0..self.book.len() {
            if mm == member {
                table.push(Some(x));
                continue;
            }
            let lsop = self.last_see(g, other_parent, mm);
            let lssp = self.last_see(g, self_parent, mm);
            table.push(self.pick_last_see(g, lsop, lssp));
        }

        let result = table.get(m).copied().flatten();
        self.slot(x).last_see = Some(table);
        result
    }

    fn pick_last_see<G: EventGraph>(
        &mut self,
        g: &G,
        lsop: Option<EventIndex>,
        lssp: Option<EventIndex>,
    ) -> Option<EventIndex> {
        let (op, sp) = match (lsop, lssp) {
            (None, sp) => return sp,
            (op, None) => return op,
            (Some(op), Some(sp)) => (op, sp),
        };
        if self.round_of(g, Some(op)) > self.round_of(g, Some(sp)) {
            return Some(op);
        }
        let newer = g.generation(op) > g.generation(sp);
        if newer && self.first_self_witness(g, Some(op)) == self.first_self_witness(g, Some(sp)) {
            Some(op)
        } else {
            Some(sp)
        }
    }

    /// Earliest self-ancestor of `x` in the same round as `x`
    pub fn first_self_witness<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>) -> Option<EventIndex> {
        let x = x?;
        // not memoized until the round is known
        g.round_created(x)?;
        if let Some(memo) = self.cached(x).and_then(|v| v.first_self_witness) {
            return memo;
        }

        let self_parent = g.self_parent(x);
        let result = if self.round_of(g, Some(x)) > self.round_of(g, self_parent) {
            Some(x)
        } else {
            self.first_self_witness(g, self_parent)
        };
        self.slot(x).first_self_witness = Some(result);
        result
    }

    /// First witness in `x`'s round found by following the parents back
    pub fn first_witness<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>) -> Option<EventIndex> {
        let x = x?;
        g.round_created(x)?;
        if let Some(memo) = self.cached(x).and_then(|v| v.first_witness) {
            return memo;
        }

        let round = self.round_of(g, Some(x));
        let self_parent = g.self_parent(x);
        let result = if round > self.parent_round(g, x) {
            Some(x)
        } else if round == self.round_of(g, self_parent) {
            self.first_witness(g, self_parent)
        } else {
            self.first_witness(g, g.other_parent(x))
        };
        self.slot(x).first_witness = Some(result);
        result
    }

    /// Witness by `m` in its round that `x` sees as latest
    pub fn first_see<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>, m: usize) -> Option<EventIndex> {
        let last = self.last_see(g, x, m);
        self.first_self_witness(g, last)
    }

    /// Witness by `m` seen by `x` through the latest event of `m2`
    fn see_thru<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>, m: usize, m2: usize) -> Option<EventIndex> {
        let xi = x?;
        if m == m2 && Some(m2) == g.member(xi) {
            return self.first_self_witness(g, g.self_parent(xi));
        }
        let through = self.last_see(g, Some(xi), m2);
        self.first_see(g, through, m)
    }

    /// Witness by `m` in the parent round of `x` that `x` strongly sees
    pub fn strongly_see_p<G: EventGraph>(&mut self, g: &G, x: Option<EventIndex>, m: usize) -> Option<EventIndex> {
        let x = x?;
        g.get(x)?;
        if let Some(table) = self.cached(x).and_then(|v| v.strongly_see_p.as_ref()) {
            return table.get(m).copied().flatten();
        }

        let n = self.book.len();
        let parent_round = self.parent_round(g, x);
        let self_parent = g.self_parent(x);
        let other_parent = g.other_parent(x);
        let mut table = vec![None; n];

        for mm in 0..n {
            if let Some(sp) = self_parent {
                let inherited = self.strongly_see_p(g, Some(sp), mm);
                if inherited.is_some() && parent_round == self.parent_round(g, sp) {
                    table[mm] = inherited;
                    continue;
                }
            }
            if let Some(op) = other_parent {
                let inherited = self.strongly_see_p(g, Some(op), mm);
                if inherited.is_some() && parent_round == self.parent_round(g, op) {
                    table[mm] = inherited;
                    continue;
                }
            }

            let candidate = self.see_thru(g, Some(x), mm, mm);
            let mut weight: u64 = 0;
            for m3 in 0..n {
                if self.see_thru(g, Some(x), mm, m3) == candidate {
                    weight += self.book.weight_at(m3);
                }
            }
            if self.round_of(g, candidate) == parent_round && self.book.is_super_majority(weight) {
                table[mm] = candidate;
            }
        }

        let result = table.get(m).copied().flatten();
        self.slot(x).strongly_see_p = Some(table);
        result
    }

    /// Witnesses of the previous round strongly seen by the witness `x`
    pub fn strongly_seen_witnesses<G: EventGraph>(&mut self, g: &G, x: EventIndex) -> Vec<EventIndex> {
        let first = self.first_witness(g, Some(x));
        (0..self.book.len())
            .filter_map(|m| self.strongly_see_p(g, first, m))
            .collect()
    }
}
