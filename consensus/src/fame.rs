//! Virtual voting on witness fame
//!
//! Each undecided witness has an election. Witnesses of later rounds vote in
//! it: the first round votes on what it sees, later rounds follow the weighted
//! majority of the witnesses they strongly see, and a supermajority decides.
//! Every `coin_freq`-th round is a coin round where no decision is taken and a
//! split vote falls back to a pseudo-random bit taken from the voter's
//! signature.

use std::collections::{BTreeMap, HashMap};
use tessera_core::{Hash, Round, Signature, TesseraError, TesseraResult, WeightSource};
use tracing::{debug, info};

use crate::address_book::SharedAddressBook;
use crate::event::Fame;
use crate::round_engine::RoundEngine;
use crate::rounds::{RoundInfo, RoundTable};
use crate::store::{DecisionRecorder, EventGraph, EventIndex};

/// Fame election for one witness
#[derive(Debug, Clone)]
pub struct Election {
    pub witness: EventIndex,
    pub round: Round,
    /// Member index of the witness' creator
    pub member: usize,
    /// Votes per voting round, indexed by voter member
    votes: BTreeMap<Round, Vec<bool>>,
}

impl Election {
    fn new(witness: EventIndex, round: Round, member: usize) -> Self {
        Self {
            witness,
            round,
            member,
            votes: BTreeMap::new(),
        }
    }

    fn open_round(&mut self, round: Round, members: usize) {
        self.votes.entry(round).or_insert_with(|| vec![false; members]);
    }

    pub fn vote_of(&self, round: Round, member: usize) -> Option<bool> {
        self.votes.get(&round).and_then(|v| v.get(member)).copied()
    }
}

/// Coin flip: low bit of the middle byte of the voter's signature
pub fn coin_bit(signature: &Signature) -> bool {
    let bytes = signature.as_bytes();
    bytes[bytes.len() / 2] & 1 == 1
}

/// Fame voter
pub struct FameVoter {
    book: SharedAddressBook,
    coin_freq: u64,
    /// Open elections, in a deterministic order
    elections: BTreeMap<EventIndex, Election>,
    /// Fame imposed by a loaded snapshot
    seeded: HashMap<Hash, bool>,
    coin_votes: u64,
}

impl FameVoter {
    pub fn new(book: SharedAddressBook, coin_freq: u64) -> Self {
        Self {
            book,
            coin_freq,
            elections: BTreeMap::new(),
            seeded: HashMap::new(),
            coin_votes: 0,
        }
    }

    pub fn seed(&mut self, fame: impl IntoIterator<Item = (Hash, bool)>) {
        self.seeded.extend(fame);
    }

    pub fn clear(&mut self) {
        self.elections.clear();
        self.seeded.clear();
    }

    pub fn open_elections(&self) -> usize {
        self.elections.len()
    }

    pub fn election(&self, witness: EventIndex) -> Option<&Election> {
        self.elections.get(&witness)
    }

    /// Votes cast in coin rounds so far
    pub fn coin_votes(&self) -> u64 {
        self.coin_votes
    }

    /// A new round exists: open a vote in it for every undecided older witness
    pub fn on_round_created(&mut self, round: Round) {
        let members = self.book.len();
        for election in self.elections.values_mut() {
            if election.round < round {
                election.open_round(round, members);
            }
        }
    }

    /// Register a witness in its round and open its election when needed
    pub fn register_witness<S: DecisionRecorder>(
        &mut self,
        witness: EventIndex,
        store: &mut S,
        rounds: &mut RoundTable,
    ) -> TesseraResult<()> {
        let (hash, round, member) = describe(&*store, witness)?;
        let settled = match rounds.get_mut(round) {
            Some(info) => {
                info.witnesses.push(witness);
                info.fame_decided
            }
            None => return Ok(()),
        };

        if let Some(famous) = self.seeded.get(&hash).copied() {
            store.record_fame(witness, Fame::from_decision(famous))?;
            if famous {
                if let Some(info) = rounds.get_mut(round) {
                    add_judge(&*store, info, member, witness);
                }
            }
            return Ok(());
        }

        if let Some(info) = rounds.get_mut(round) {
            info.num_unknown_fame += 1;
        }

        if settled || rounds.contains(round + 2) {
            debug!("Witness {} arrived late for round {}, not famous", hash, round);
            return self.decide(witness, false, store, rounds);
        }

        let mut election = Election::new(witness, round, member);
        if rounds.contains(round + 1) {
            election.open_round(round + 1, self.book.len());
        }
        self.elections.insert(witness, election);
        Ok(())
    }

    /// Let a witness vote in every election open in its round
    pub fn vote<S: DecisionRecorder>(
        &mut self,
        voter: EventIndex,
        engine: &mut RoundEngine,
        store: &mut S,
        rounds: &mut RoundTable,
    ) -> TesseraResult<()> {
        let (_, voter_round, voter_member) = describe(&*store, voter)?;
        let candidates: Vec<EventIndex> = self
            .elections
            .iter()
            .filter(|(_, e)| e.votes.contains_key(&voter_round))
            .map(|(idx, _)| *idx)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let signature = store
            .get(voter)
            .map(|e| e.event.signature)
            .unwrap_or(Signature::EMPTY);
        let strongly_seen = engine.strongly_seen_witnesses(&*store, voter);

        for candidate in candidates {
            let (round, member) = match self.elections.get(&candidate) {
                Some(e) => (e.round, e.member),
                None => continue,
            };
            let age = voter_round - round;

            let (vote, decision) = if age == 1 {
                (self.first_vote(engine, &*store, voter, voter_round, candidate, member), None)
            } else {
                self.tally(&*store, candidate, voter_round, age, &strongly_seen, &signature)
            };

            if let Some(election) = self.elections.get_mut(&candidate) {
                if let Some(slot) = election
                    .votes
                    .get_mut(&voter_round)
                    .and_then(|v| v.get_mut(voter_member))
                {
                    *slot = vote;
                }
            }

            if let Some(famous) = decision {
                self.decide(candidate, famous, store, rounds)?;
            }
        }
        Ok(())
    }

    /// Vote of a witness one round above the candidate: does it see it
    fn first_vote<G: EventGraph>(
        &self,
        engine: &mut RoundEngine,
        store: &G,
        voter: EventIndex,
        voter_round: Round,
        candidate: EventIndex,
        candidate_member: usize,
    ) -> bool {
        let mut seen = engine.first_see(store, Some(voter), candidate_member);
        while let Some(w) = seen {
            if engine.round_of(store, Some(w)) <= voter_round - 1 {
                break;
            }
            match store.self_parent(w) {
                Some(sp) => seen = engine.first_self_witness(store, Some(sp)),
                None => break,
            }
        }
        seen == Some(candidate)
    }

    /// Weighted majority of the strongly seen witnesses' previous votes
    fn tally<G: EventGraph>(
        &mut self,
        store: &G,
        candidate: EventIndex,
        voter_round: Round,
        age: Round,
        strongly_seen: &[EventIndex],
        signature: &Signature,
    ) -> (bool, Option<bool>) {
        let election = match self.elections.get(&candidate) {
            Some(e) => e,
            None => return (false, None),
        };

        let mut yes: u64 = 0;
        let mut no: u64 = 0;
        for witness in strongly_seen {
            let member = match store.member(*witness) {
                Some(m) => m,
                None => continue,
            };
            let weight = self.book.weight_at(member);
            if election.vote_of(voter_round - 1, member).unwrap_or(false) {
                yes += weight;
            } else {
                no += weight;
            }
        }

        let super_majority = self.book.is_super_majority(yes) || self.book.is_super_majority(no);
        let majority = yes >= no;
        let coin_freq = self.coin_freq as Round;

        if age % coin_freq == 0 {
            self.coin_votes += 1;
            if super_majority {
                (majority, None)
            } else if age % (2 * coin_freq) == coin_freq {
                (true, None)
            } else {
                (coin_bit(signature), None)
            }
        } else if super_majority {
            (majority, Some(majority))
        } else {
            (majority, None)
        }
    }

    /// Settle the fame of a witness
    fn decide<S: DecisionRecorder>(
        &mut self,
        witness: EventIndex,
        famous: bool,
        store: &mut S,
        rounds: &mut RoundTable,
    ) -> TesseraResult<()> {
        self.elections.remove(&witness);
        store.record_fame(witness, Fame::from_decision(famous))?;

        let (hash, round, member) = describe(&*store, witness)?;
        let info = rounds.get_mut(round).ok_or_else(|| {
            TesseraError::InvariantViolation(format!("fame decided for {} in unknown round {}", hash, round))
        })?;
        if famous {
            add_judge(&*store, info, member, witness);
        }
        info.num_unknown_fame = info.num_unknown_fame.checked_sub(1).ok_or_else(|| {
            TesseraError::InvariantViolation(format!("round {} has no witness left to decide", round))
        })?;

        debug!("Witness {} of round {} is {}", hash, round, if famous { "famous" } else { "not famous" });

        if info.num_unknown_fame == 0 && !info.fame_decided {
            info.fame_decided = true;
            info!(
                "Fame decided for round {}: {} judges of {} witnesses",
                round,
                info.judges.len(),
                info.witnesses.len()
            );
        }
        Ok(())
    }
}

/// Hash, round and member of a stored event whose round is known
fn describe<G: EventGraph>(store: &G, idx: EventIndex) -> TesseraResult<(Hash, Round, usize)> {
    let stored = store
        .get(idx)
        .ok_or_else(|| TesseraError::InvariantViolation(format!("event index {} is not live", idx.as_usize())))?;
    let round = stored.decisions.round_created.ok_or_else(|| {
        TesseraError::InvariantViolation(format!("event {} has no round", stored.event.hash))
    })?;
    Ok((stored.event.hash, round, stored.member))
}

/// Keep one judge per member; on a fork the lowest hash wins
fn add_judge<G: EventGraph>(store: &G, info: &mut RoundInfo, member: usize, witness: EventIndex) {
    let replace = match info.judges.get(&member) {
        None => true,
        Some(existing) => {
            let current = store.get(*existing).map(|e| e.event.hash);
            let candidate = store.get(witness).map(|e| e.event.hash);
            candidate < current
        }
    };
    if replace {
        info.judges.insert(member, witness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::AddressBook;
    use crate::event::Event;
    use crate::store::EventStore;
    use std::sync::Arc;
    use tessera_core::{NodeId, Timestamp};

    fn voter(coin_freq: u64) -> FameVoter {
        let book = Arc::new(AddressBook::equal_weights((0..4).map(NodeId)).unwrap());
        FameVoter::new(book, coin_freq)
    }

    fn witness(store: &mut EventStore, creator: u64, round: Round) -> EventIndex {
        let event = Arc::new(Event::new(
            NodeId(creator),
            None,
            None,
            Timestamp::from_millis(round as u64 * 10 + creator),
            vec![],
            |_| Signature::EMPTY,
        ));
        let idx = store.insert(event, creator as usize).unwrap();
        store.record_round(idx, round, true).unwrap();
        idx
    }

    fn signature_with_middle(byte: u8) -> Signature {
        let mut bytes = [0u8; 64];
        bytes[32] = byte;
        Signature::from_bytes(bytes)
    }

    /// Voters of the previous round, one per member, and an election
    /// where the given members voted yes in `round - 1`
    fn split_election(voter: &mut FameVoter, store: &mut EventStore, round: Round, yes: &[usize]) -> (EventIndex, Vec<EventIndex>) {
        let candidate = witness(store, 0, 1);
        let previous: Vec<EventIndex> = (0..4).map(|m| witness(store, m, round - 1)).collect();
        let mut election = Election::new(candidate, 1, 0);
        election.open_round(round - 1, 4);
        for member in yes {
            election.votes.get_mut(&(round - 1)).unwrap()[*member] = true;
        }
        voter.elections.insert(candidate, election);
        (candidate, previous)
    }

    #[test]
    fn test_witness_after_two_rounds_is_not_famous() {
        let mut voter = voter(12);
        let mut store = EventStore::new();
        let mut rounds = RoundTable::new();
        for round in 1..=3 {
            rounds.create(round);
        }

        let early = witness(&mut store, 0, 2);
        voter.register_witness(early, &mut store, &mut rounds).unwrap();
        assert!(voter.election(early).is_some());
        assert_eq!(store.decisions(early).unwrap().fame, Fame::Undecided);
        assert_eq!(voter.election(early).unwrap().vote_of(3, 0), Some(false));

        let late = witness(&mut store, 1, 1);
        voter.register_witness(late, &mut store, &mut rounds).unwrap();
        assert!(voter.election(late).is_none());
        assert_eq!(store.decisions(late).unwrap().fame, Fame::NotFamous);

        let info = rounds.get(1).unwrap();
        assert_eq!(info.witnesses, vec![late]);
        assert_eq!(info.num_unknown_fame, 0);
        assert!(info.fame_decided);
        assert!(info.judges.is_empty());
    }

    #[test]
    fn test_witness_of_settled_round_is_not_famous() {
        let mut voter = voter(12);
        let mut store = EventStore::new();
        let mut rounds = RoundTable::new();
        rounds.create(1);
        rounds.get_mut(1).unwrap().fame_decided = true;

        let late = witness(&mut store, 2, 1);
        voter.register_witness(late, &mut store, &mut rounds).unwrap();
        assert_eq!(store.decisions(late).unwrap().fame, Fame::NotFamous);
        assert_eq!(voter.open_elections(), 0);
    }

    #[test]
    fn test_coin_round_forces_yes_on_split_vote() {
        let mut voter = voter(2);
        let mut store = EventStore::new();
        // age 2 with coin_freq 2: age % 4 == 2
        let (candidate, previous) = split_election(&mut voter, &mut store, 3, &[0, 1]);
        let outcome = voter.tally(&store, candidate, 3, 2, &previous, &signature_with_middle(0));
        assert_eq!(outcome, (true, None));
        assert_eq!(voter.coin_votes(), 1);
    }

    #[test]
    fn test_coin_round_flips_signature_bit_on_split_vote() {
        let mut voter = voter(2);
        let mut store = EventStore::new();
        // age 4 with coin_freq 2: age % 4 == 0
        let (candidate, previous) = split_election(&mut voter, &mut store, 5, &[2, 3]);
        assert_eq!(
            voter.tally(&store, candidate, 5, 4, &previous, &signature_with_middle(1)),
            (true, None)
        );
        assert_eq!(
            voter.tally(&store, candidate, 5, 4, &previous, &signature_with_middle(2)),
            (false, None)
        );
        assert_eq!(voter.coin_votes(), 2);
    }

    #[test]
    fn test_coin_round_never_decides() {
        let mut voter = voter(2);
        let mut store = EventStore::new();
        let (candidate, previous) = split_election(&mut voter, &mut store, 3, &[]);
        // a unanimous no is followed but not settled
        let outcome = voter.tally(&store, candidate, 3, 2, &previous, &signature_with_middle(1));
        assert_eq!(outcome, (false, None));

        // the same unanimity decides in a normal round
        let mut voter = FameVoter::new(voter.book.clone(), 2);
        let mut store = EventStore::new();
        let (candidate, previous) = split_election(&mut voter, &mut store, 4, &[0, 1, 2, 3]);
        let outcome = voter.tally(&store, candidate, 4, 3, &previous, &signature_with_middle(0));
        assert_eq!(outcome, (true, Some(true)));
        assert_eq!(voter.coin_votes(), 0);
    }

    #[test]
    fn test_coin_bit_uses_middle_byte() {
        let mut bytes = [0u8; 64];
        assert!(!coin_bit(&Signature::from_bytes(bytes)));
        bytes[32] = 3;
        assert!(coin_bit(&Signature::from_bytes(bytes)));
        bytes[32] = 2;
        bytes[0] = 1;
        bytes[63] = 1;
        assert!(!coin_bit(&Signature::from_bytes(bytes)));
    }

    #[test]
    fn test_election_votes_default_to_no() {
        let mut election = Election::new(EventIndex(3), 2, 1);
        assert_eq!(election.vote_of(3, 0), None);
        election.open_round(3, 4);
        assert_eq!(election.vote_of(3, 0), Some(false));
        assert_eq!(election.vote_of(3, 4), None);
    }
}
