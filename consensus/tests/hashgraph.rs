mod common;

use common::*;
use std::collections::{HashMap, HashSet};
use tessera_consensus::{create_round_channel, Consensus, Event, Fame, ParentRef};
use tessera_core::{ConsensusConfig, Hash, NodeId, Signature, TesseraError, Timestamp};

#[test]
fn test_four_members_first_rounds() {
    let consensus = equal_engine(4, ConsensusConfig::default());
    let events = round_robin(4, 16);

    // nothing is decided before the first round-3 witness
    for event in &events[..11] {
        assert!(consensus.add_event(event.clone()).unwrap().is_empty());
    }
    assert_eq!(consensus.max_round(), 2);
    assert_eq!(consensus.fame_decided_below(), 1);

    let decided = consensus.add_event(events[11].clone()).unwrap();
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].round, 1);
    assert!(decided[0].is_empty());
    assert_eq!(decided[0].judges.len(), 4);
    assert_eq!(consensus.fame_decided_below(), 2);
    for genesis in &events[..4] {
        assert_eq!(consensus.fame(&genesis.hash), Some(Fame::Famous));
    }

    for event in &events[12..15] {
        assert!(consensus.add_event(event.clone()).unwrap().is_empty());
    }
    let decided = consensus.add_event(events[15].clone()).unwrap();
    assert_eq!(decided.len(), 1);
    let round = &decided[0];
    assert_eq!(round.round, 2);
    assert_eq!(round.len(), 8);

    let received: HashSet<Hash> = round.hashes().into_iter().collect();
    let expected: HashSet<Hash> = events[..8].iter().map(|e| e.hash).collect();
    assert_eq!(received, expected);

    // g_D has the earliest median, e4 the latest
    assert_eq!(round.events[0].hash(), events[3].hash);
    assert_eq!(round.events[0].consensus_timestamp, Timestamp::from_millis(6));
    assert_eq!(round.events[7].hash(), events[7].hash);
    assert_eq!(round.events[7].consensus_timestamp, Timestamp::from_millis(10));
    assert!(round.events[7].last_in_round_received);

    let tied: HashSet<Hash> = [round.events[1].hash(), round.events[2].hash()].into_iter().collect();
    assert_eq!(tied, [events[0].hash, events[4].hash].into_iter().collect());
    assert_eq!(
        round.events.iter().map(|e| e.consensus_order).collect::<Vec<_>>(),
        (0..8).collect::<Vec<u64>>()
    );
    for pair in round.events.windows(2) {
        assert!(pair[0].consensus_timestamp < pair[1].consensus_timestamp);
    }
}

#[test]
fn test_zero_weight_member_is_never_famous() {
    let consensus = engine(&[(0, 1), (1, 1), (2, 1), (3, 1), (4, 0)], ConsensusConfig::default());
    let events = round_robin(4, 16);
    let lonely = Event::new(NodeId(4), None, None, Timestamp::from_millis(1), vec![], |_| Signature::EMPTY);

    feed(&consensus, &events[..4]);
    assert!(consensus.add_event(lonely.clone()).unwrap().is_empty());
    assert_eq!(consensus.round_created(&lonely.hash), Some(1));

    feed(&consensus, &events[4..11]);
    let decided = consensus.add_event(events[11].clone()).unwrap();
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].round, 1);
    assert_eq!(consensus.fame(&lonely.hash), Some(Fame::NotFamous));
    assert!(!decided[0].judges.contains(&lonely.hash));
    assert_eq!(decided[0].judges.len(), 4);

    let decided = feed(&consensus, &events[12..]);
    assert_eq!(decided.len(), 1);
    assert!(!decided[0].hashes().contains(&lonely.hash));
}

/// Members take turns as listed, each syncing with the previous event
#[derive(Default)]
struct Relay {
    latest: HashMap<u64, Event>,
    last: Option<Event>,
    clock: u64,
}

impl Relay {
    fn add(&mut self, consensus: &Consensus, creator: u64) -> Event {
        self.clock += 1;
        let event = Event::new(
            NodeId(creator),
            self.latest.get(&creator).map(ParentRef::of),
            self.last.as_ref().filter(|_| self.latest.contains_key(&creator)).map(ParentRef::of),
            Timestamp::from_millis(self.clock),
            vec![],
            |_| Signature::EMPTY,
        );
        consensus.add_event(event.clone()).unwrap();
        self.latest.insert(creator, event.clone());
        self.last = Some(event.clone());
        event
    }
}

#[test]
fn test_zero_weight_relay_neither_counts_nor_blocks() {
    let consensus = engine(&[(0, 1), (1, 1), (2, 1), (3, 1), (4, 0)], ConsensusConfig::default());
    let mut relay = Relay::default();
    let genesis: Vec<Event> = (0..5).map(|id| relay.add(&consensus, id)).collect();

    // two weighted members gossip through the zero-weight one
    for i in 0..30 {
        relay.add(&consensus, [0, 1, 4][i % 3]);
    }
    let latest = relay.latest[&0].hash;
    assert!(consensus.sees(&latest, &genesis[1].hash));
    assert!(consensus.sees(&latest, &genesis[4].hash));
    assert!(!consensus.strongly_sees(&latest, &genesis[1].hash));
    assert_eq!(consensus.max_round(), 1);

    // a third weighted member completes the supermajority with the relay still in the loop
    for i in 0..80 {
        relay.add(&consensus, [2, 0, 4, 1][i % 4]);
    }
    let latest = relay.latest[&0].hash;
    assert!(consensus.strongly_sees(&latest, &genesis[1].hash));
    assert!(consensus.max_round() >= 3);
    assert!(consensus.fame_decided_below() > 1);
    assert_eq!(consensus.fame(&genesis[3].hash), Some(Fame::NotFamous));
}

#[test]
fn test_unreferenced_events_become_stale() {
    let config = ConsensusConfig {
        rounds_non_ancient: 2,
        ..Default::default()
    };
    let consensus = engine(&[(0, 1), (1, 1), (2, 1), (3, 1), (4, 0)], config);
    let lonely = Event::new(NodeId(4), None, None, Timestamp::from_millis(1), vec![], |_| Signature::EMPTY);
    consensus.add_event(lonely.clone()).unwrap();

    let decided = feed(&consensus, &round_robin(4, 40));
    let stale: Vec<Hash> = decided.iter().flat_map(|r| r.stale.iter().copied()).collect();
    assert_eq!(stale, vec![lonely.hash]);
    assert!(consensus.decisions(&lonely.hash).unwrap().stale);
    assert!(decided.iter().all(|r| !r.hashes().contains(&lonely.hash)));
    assert_eq!(consensus.stats().stale_events, 1);
}

#[test]
fn test_consensus_stream_is_consistent() {
    let consensus = equal_engine(4, ConsensusConfig::default());
    let events = random_gossip(4, 17, 400);
    let decided = feed(&consensus, &events);
    assert!(decided.len() > 5);

    let mut expected_round = 1;
    let mut expected_order = 0;
    let mut last_timestamp = None;
    let mut seen = HashSet::new();
    for round in &decided {
        assert_eq!(round.round, expected_round);
        expected_round += 1;
        assert!(round.snapshot.verify().is_ok());
        assert_eq!(round.snapshot.decided_round(), round.round);

        for (i, event) in round.events.iter().enumerate() {
            assert_eq!(event.consensus_order, expected_order);
            expected_order += 1;
            assert_eq!(event.round_received, round.round);
            assert!(event.round_received >= event.round_created);
            assert_eq!(event.last_in_round_received, i + 1 == round.events.len());
            if let Some(previous) = last_timestamp {
                assert!(event.consensus_timestamp > previous);
            }
            last_timestamp = Some(event.consensus_timestamp);
            assert!(seen.insert(event.hash()));
        }
    }
    assert_eq!(consensus.fame_decided_below(), expected_round);
}

#[test]
fn test_rounds_follow_parents() {
    let consensus = equal_engine(5, ConsensusConfig::default());
    let events = random_gossip(5, 3, 250);
    feed(&consensus, &events);

    for event in &events {
        let decisions = match consensus.decisions(&event.hash) {
            Some(d) => d,
            None => continue,
        };
        let round = decisions.round_created.unwrap();
        let parent_rounds: Vec<i64> = event
            .parents()
            .filter_map(|p| consensus.round_created(&p.hash))
            .collect();
        let highest = parent_rounds.iter().copied().max().unwrap_or(0);
        assert!(round == highest || round == highest + 1);

        let self_parent_round = event
            .self_parent
            .and_then(|p| consensus.round_created(&p.hash))
            .unwrap_or(0);
        assert_eq!(decisions.is_witness, round > self_parent_round);
        if decisions.fame != Fame::Undecided {
            assert!(decisions.is_witness);
        }
    }
}

#[test]
fn test_rejections_leave_state_untouched() {
    let consensus = equal_engine(4, ConsensusConfig::default());
    let events = random_gossip(4, 5, 80);
    feed(&consensus, &events);
    let before = consensus.stats();

    assert!(matches!(
        consensus.add_event(events[40].clone()),
        Err(TesseraError::DuplicateEvent(_))
    ));

    let mut tampered = events[50].clone();
    tampered.transactions.push(b"forged".to_vec());
    assert!(matches!(
        consensus.add_event(tampered),
        Err(TesseraError::HashMismatch { .. })
    ));

    let missing = Event::new(
        NodeId(1),
        Some(ParentRef::of(&events[79])),
        Some(ParentRef::new(Hash::from_bytes([3; 32]), 60)),
        Timestamp::from_millis(10_000),
        vec![],
        |_| Signature::EMPTY,
    );
    assert!(matches!(
        consensus.add_event(missing),
        Err(TesseraError::UnknownParent { .. })
    ));

    let lying = Event::new(
        NodeId(2),
        None,
        Some(ParentRef::new(events[79].hash, events[79].generation + 4)),
        Timestamp::from_millis(10_000),
        vec![],
        |_| Signature::EMPTY,
    );
    assert!(matches!(
        consensus.add_event(lying),
        Err(TesseraError::GenerationMismatch { .. })
    ));

    let stranger = Event::new(NodeId(42), None, None, Timestamp::from_millis(1), vec![], |_| Signature::EMPTY);
    assert!(matches!(
        consensus.add_event(stranger),
        Err(TesseraError::UnknownCreator(_))
    ));

    assert_eq!(consensus.stats(), before);
    assert!(!consensus.is_halted());
}

#[test]
fn test_memory_stays_bounded() {
    let config = ConsensusConfig {
        rounds_non_ancient: 2,
        rounds_expired: 4,
        ..Default::default()
    };
    let consensus = equal_engine(4, config);
    let events = round_robin(4, 2000);
    let decided = feed(&consensus, &events);
    assert!(decided.len() > 400);

    let stats = consensus.stats();
    assert!(stats.rounds <= 7, "retained {} rounds", stats.rounds);
    assert!(stats.events < 60, "retained {} events", stats.events);
    assert!(stats.arena_slots <= stats.events + 4, "arena spans {} slots", stats.arena_slots);
    assert!(stats.memo_entries <= stats.events, "{} memo entries", stats.memo_entries);
    assert!(!consensus.contains(&events[0].hash));
    assert!(consensus.contains(&events[1999].hash));

    // late arrivals below the ancient floor do not break anything
    let late = Event::new(
        NodeId(0),
        Some(ParentRef::of(&events[4])),
        None,
        Timestamp::from_millis(6),
        vec![],
        |_| Signature::EMPTY,
    );
    assert!(consensus.add_event(late).is_ok());
    assert!(!consensus.is_halted());
}

#[test]
fn test_pces_replay_flag() {
    let consensus = equal_engine(4, ConsensusConfig::default());
    let events = round_robin(4, 24);
    let early = feed(&consensus, &events[..12]);
    assert!(early.iter().all(|r| !r.pces_replay));

    consensus.set_pces_mode(true);
    let replayed = feed(&consensus, &events[12..]);
    assert!(!replayed.is_empty());
    assert!(replayed.iter().all(|r| r.pces_replay));
}

#[tokio::test]
async fn test_rounds_are_published_on_channel() {
    let mut consensus = equal_engine(4, ConsensusConfig::default());
    let (tx, mut rx) = create_round_channel(16);
    consensus.set_round_channel(tx);

    let returned = feed(&consensus, &round_robin(4, 20));
    assert_eq!(returned.len(), 3);

    for expected in &returned {
        let published = rx.recv().await.unwrap();
        assert_eq!(published.round, expected.round);
        assert_eq!(published.hashes(), expected.hashes());
    }
    assert!(rx.try_recv().is_err());
}
