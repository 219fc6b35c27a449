//! Consensus snapshot functionality

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{Hash, NodeId, Round, TesseraError, TesseraResult, Timestamp};
use tessera_crypto::hashing::{merkle_root, IncrementalHasher};
use tracing::debug;

const SNAPSHOT_DOMAIN: &str = "tessera consensus snapshot v1";

/// Number of rounds, counting down from the last decided one, whose witnesses
/// are recorded in a snapshot
pub const SNAPSHOT_WITNESS_ROUNDS: Round = 3;

/// A witness recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWitness {
    pub round: Round,
    pub creator: NodeId,
    pub hash: Hash,
    pub generation: u64,
    pub famous: bool,
}

impl SnapshotWitness {
    fn leaf(&self) -> Hash {
        let mut hasher = IncrementalHasher::with_domain(SNAPSHOT_DOMAIN);
        hasher
            .update(b"witness")
            .update_u64(self.round as u64)
            .update_u64(self.creator.as_u64())
            .update(self.hash.as_bytes())
            .update_u64(self.generation)
            .update(&[self.famous as u8]);
        hasher.finalize()
    }
}

/// Minimum judge generation of a decided round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundGeneration {
    pub round: Round,
    pub min_generation: u64,
}

/// Minimal checkpoint from which consensus can resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    /// Lowest round whose fame is not yet decided
    pub fame_decided_below: Round,
    /// Judges of the last decided round, plus the witnesses of the two rounds
    /// before it that are ancestors of those judges
    pub judges: Vec<SnapshotWitness>,
    /// Minimum judge generation of every non-ancient decided round
    pub round_generations: Vec<RoundGeneration>,
    /// Events with a lower generation are ancient
    pub ancient_generation: u64,
    /// Lowest generation each creator still has retained
    pub creator_floors: BTreeMap<NodeId, u64>,
    /// Order number the next consensus event will get
    pub next_consensus_order: u64,
    /// Timestamp of the last transaction of the last consensus event
    pub last_consensus_timestamp: Option<Timestamp>,
    /// Merkle root over all of the above
    pub digest: Hash,
}

impl ConsensusSnapshot {
    /// Create a snapshot, computing its digest
    pub fn new(
        fame_decided_below: Round,
        mut judges: Vec<SnapshotWitness>,
        mut round_generations: Vec<RoundGeneration>,
        ancient_generation: u64,
        creator_floors: BTreeMap<NodeId, u64>,
        next_consensus_order: u64,
        last_consensus_timestamp: Option<Timestamp>,
    ) -> Self {
        judges.sort_by(|a, b| (a.round, a.creator, a.hash).cmp(&(b.round, b.creator, b.hash)));
        round_generations.sort_by_key(|g| g.round);

        let mut snapshot = Self {
            fame_decided_below,
            judges,
            round_generations,
            ancient_generation,
            creator_floors,
            next_consensus_order,
            last_consensus_timestamp,
            digest: Hash::ZERO,
        };
        snapshot.digest = snapshot.compute_digest();
        snapshot
    }

    /// Last round whose fame is decided
    pub fn decided_round(&self) -> Round {
        self.fame_decided_below - 1
    }

    /// Judges of the last decided round
    pub fn last_round_judges(&self) -> impl Iterator<Item = &SnapshotWitness> {
        let round = self.decided_round();
        self.judges.iter().filter(move |w| w.round == round && w.famous)
    }

    pub fn min_generation_of(&self, round: Round) -> Option<u64> {
        self.round_generations
            .iter()
            .find(|g| g.round == round)
            .map(|g| g.min_generation)
    }

    /// Lowest round with a recorded minimum generation
    pub fn oldest_round(&self) -> Round {
        self.round_generations
            .first()
            .map(|g| g.round)
            .unwrap_or_else(|| self.decided_round())
    }

    fn compute_digest(&self) -> Hash {
        let mut leaves: Vec<Hash> = self.judges.iter().map(SnapshotWitness::leaf).collect();

        for generation in &self.round_generations {
            let mut hasher = IncrementalHasher::with_domain(SNAPSHOT_DOMAIN);
            hasher
                .update(b"round")
                .update_u64(generation.round as u64)
                .update_u64(generation.min_generation);
            leaves.push(hasher.finalize());
        }

        for (creator, floor) in &self.creator_floors {
            let mut hasher = IncrementalHasher::with_domain(SNAPSHOT_DOMAIN);
            hasher
                .update(b"floor")
                .update_u64(creator.as_u64())
                .update_u64(*floor);
            leaves.push(hasher.finalize());
        }

        let mut header = IncrementalHasher::with_domain(SNAPSHOT_DOMAIN);
        header
            .update(b"header")
            .update_u64(self.fame_decided_below as u64)
            .update_u64(self.ancient_generation)
            .update_u64(self.next_consensus_order);
        match self.last_consensus_timestamp {
            Some(ts) => header.update(&[1]).update_u64(ts.as_nanos()),
            None => header.update(&[0]),
        };
        leaves.push(header.finalize());

        merkle_root(&leaves)
    }

    /// Verify snapshot integrity and internal consistency
    pub fn verify(&self) -> TesseraResult<()> {
        if self.compute_digest() != self.digest {
            return Err(TesseraError::InvalidSnapshot("digest mismatch".into()));
        }
        if self.fame_decided_below < 2 {
            return Err(TesseraError::InvalidSnapshot(format!(
                "fame_decided_below {} leaves no decided round",
                self.fame_decided_below
            )));
        }

        let decided = self.decided_round();
        let lowest = decided - SNAPSHOT_WITNESS_ROUNDS + 1;
        let mut seen = BTreeSet::new();
        for witness in &self.judges {
            if witness.round > decided || witness.round < lowest {
                return Err(TesseraError::InvalidSnapshot(format!(
                    "witness {} in round {} outside rounds {}..={}",
                    witness.hash, witness.round, lowest, decided
                )));
            }
            if !seen.insert(witness.hash) {
                return Err(TesseraError::InvalidSnapshot(format!(
                    "witness {} listed twice",
                    witness.hash
                )));
            }
        }
        if self.last_round_judges().next().is_none() {
            return Err(TesseraError::InvalidSnapshot(format!(
                "no judges recorded for round {}",
                decided
            )));
        }

        if let Some(newest) = self.round_generations.last() {
            if newest.round > decided {
                return Err(TesseraError::InvalidSnapshot(format!(
                    "round generation recorded for undecided round {}",
                    newest.round
                )));
            }
        }
        if self.min_generation_of(decided).is_none() {
            return Err(TesseraError::InvalidSnapshot(format!(
                "no minimum generation recorded for round {}",
                decided
            )));
        }

        Ok(())
    }

    /// Serialize snapshot to bytes
    pub fn to_bytes(&self) -> TesseraResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize snapshot from bytes
    pub fn from_bytes(bytes: &[u8]) -> TesseraResult<Self> {
        let snapshot: ConsensusSnapshot = bincode::deserialize(bytes)?;
        debug!(
            "Decoded snapshot at round {} ({} witnesses)",
            snapshot.decided_round(),
            snapshot.judges.len()
        );
        Ok(snapshot)
    }

    /// Human-readable JSON rendering
    pub fn to_json(&self) -> TesseraResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> TesseraResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Bounded history of recent snapshots
pub struct SnapshotManager {
    snapshots: Vec<ConsensusSnapshot>,
    max_snapshots: usize,
}

impl SnapshotManager {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: Vec::new(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Add a new snapshot, replacing any older one for the same round
    pub fn add(&mut self, snapshot: ConsensusSnapshot) {
        self.snapshots
            .retain(|s| s.fame_decided_below != snapshot.fame_decided_below);
        self.snapshots.push(snapshot);
        self.snapshots.sort_by_key(|s| s.fame_decided_below);

        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.remove(0);
        }
    }

    /// Get the latest snapshot
    pub fn latest(&self) -> Option<&ConsensusSnapshot> {
        self.snapshots.last()
    }

    /// Get the snapshot taken right after `round` was decided
    pub fn at_round(&self, round: Round) -> Option<&ConsensusSnapshot> {
        self.snapshots.iter().find(|s| s.decided_round() == round)
    }

    /// Get the newest snapshot not past `round`
    pub fn closest_to(&self, round: Round) -> Option<&ConsensusSnapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.decided_round() <= round)
            .max_by_key(|s| s.decided_round())
    }

    /// Decided rounds of all retained snapshots
    pub fn rounds(&self) -> Vec<Round> {
        self.snapshots.iter().map(|s| s.decided_round()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Clear all snapshots
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_crypto::hashing::hash;

    fn sample_snapshot(decided: Round) -> ConsensusSnapshot {
        let judges = (0..4u64)
            .map(|i| SnapshotWitness {
                round: decided,
                creator: NodeId(i),
                hash: hash(&[decided as u8, i as u8]),
                generation: 10 + i,
                famous: true,
            })
            .chain(std::iter::once(SnapshotWitness {
                round: decided - 1,
                creator: NodeId(0),
                hash: hash(b"older"),
                generation: 6,
                famous: false,
            }))
            .collect();
        let generations = vec![
            RoundGeneration { round: decided, min_generation: 10 },
            RoundGeneration { round: decided - 1, min_generation: 6 },
        ];
        let floors = (0..4u64).map(|i| (NodeId(i), 5)).collect();

        ConsensusSnapshot::new(
            decided + 1,
            judges,
            generations,
            6,
            floors,
            42,
            Some(Timestamp::from_millis(1_000)),
        )
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = sample_snapshot(5);
        assert!(snapshot.verify().is_ok());

        let bytes = snapshot.to_bytes().unwrap();
        let restored = ConsensusSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(restored, snapshot);
        assert!(restored.verify().is_ok());

        let json = snapshot.to_json().unwrap();
        assert_eq!(ConsensusSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_contents_are_normalized() {
        let snapshot = sample_snapshot(5);
        assert_eq!(snapshot.decided_round(), 5);
        assert_eq!(snapshot.last_round_judges().count(), 4);
        assert_eq!(snapshot.judges[0].round, 4);
        assert_eq!(snapshot.oldest_round(), 4);
        assert_eq!(snapshot.min_generation_of(5), Some(10));
        assert_eq!(snapshot.min_generation_of(3), None);
    }

    #[test]
    fn test_tampered_snapshot_fails_verification() {
        let mut snapshot = sample_snapshot(5);
        snapshot.next_consensus_order += 1;
        assert!(matches!(
            snapshot.verify(),
            Err(TesseraError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_inconsistent_snapshot_fails_verification() {
        let mut snapshot = sample_snapshot(5);
        snapshot.judges[0].round = 9;
        snapshot.digest = snapshot.compute_digest();
        assert!(snapshot.verify().is_err());

        let empty = ConsensusSnapshot::new(6, vec![], vec![], 0, BTreeMap::new(), 0, None);
        assert!(empty.verify().is_err());
    }

    #[test]
    fn test_snapshot_manager() {
        let mut manager = SnapshotManager::new(3);

        for round in 3..8 {
            manager.add(sample_snapshot(round));
        }

        assert_eq!(manager.rounds(), vec![5, 6, 7]);
        assert_eq!(manager.latest().unwrap().decided_round(), 7);
        assert!(manager.at_round(4).is_none());
        assert_eq!(manager.closest_to(100).unwrap().decided_round(), 7);
        assert_eq!(manager.closest_to(6).unwrap().decided_round(), 6);
        assert!(manager.closest_to(2).is_none());

        manager.add(sample_snapshot(6));
        assert_eq!(manager.len(), 3);
    }
}
