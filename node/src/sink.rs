//! Consumers of decided rounds

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tessera_consensus::ConsensusRound;
use tessera_core::{Round, Timestamp};
use tessera_state::{ConsensusSnapshot, SnapshotManager};
use tracing::{debug, info};

/// Receives every round that reaches consensus, in order
#[async_trait]
pub trait RoundSink: Send + Sync {
    async fn on_round(&self, round: &ConsensusRound) -> anyhow::Result<()>;
}

/// Logs each round
pub struct LogSink;

#[async_trait]
impl RoundSink for LogSink {
    async fn on_round(&self, round: &ConsensusRound) -> anyhow::Result<()> {
        info!(
            "Round {}: {} events, {} transactions{}",
            round.round,
            round.len(),
            round.transaction_count(),
            if round.pces_replay { " (replay)" } else { "" }
        );
        for event in &round.events {
            debug!(
                "  #{} {} by {} at {}",
                event.consensus_order,
                event.hash(),
                event.event.creator,
                event.consensus_timestamp
            );
        }
        Ok(())
    }
}

/// Keeps the snapshots of the most recent rounds
pub struct SnapshotSink {
    manager: Mutex<SnapshotManager>,
}

impl SnapshotSink {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            manager: Mutex::new(SnapshotManager::new(max_snapshots)),
        }
    }

    pub fn latest(&self) -> Option<ConsensusSnapshot> {
        self.manager.lock().latest().cloned()
    }

    pub fn at_round(&self, round: Round) -> Option<ConsensusSnapshot> {
        self.manager.lock().at_round(round).cloned()
    }

    pub fn rounds(&self) -> Vec<Round> {
        self.manager.lock().rounds()
    }
}

#[async_trait]
impl RoundSink for SnapshotSink {
    async fn on_round(&self, round: &ConsensusRound) -> anyhow::Result<()> {
        round.snapshot.verify()?;
        self.manager.lock().add(round.snapshot.clone());
        Ok(())
    }
}

/// Running totals over the consensus stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub rounds: u64,
    pub empty_rounds: u64,
    pub events: u64,
    pub transactions: u64,
    pub stale: u64,
    pub last_round: Option<Round>,
    pub last_timestamp: Option<Timestamp>,
}

/// Accumulates a [`Tally`] and checks the stream is well formed
#[derive(Default)]
pub struct TallySink {
    tally: Mutex<Tally>,
}

impl TallySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tally(&self) -> Tally {
        self.tally.lock().clone()
    }
}

#[async_trait]
impl RoundSink for TallySink {
    async fn on_round(&self, round: &ConsensusRound) -> anyhow::Result<()> {
        let mut tally = self.tally.lock();
        if let Some(last) = tally.last_round {
            anyhow::ensure!(
                round.round == last + 1,
                "round {} emitted after round {}",
                round.round,
                last
            );
        }
        for event in &round.events {
            if let Some(previous) = tally.last_timestamp {
                anyhow::ensure!(
                    event.consensus_timestamp > previous,
                    "consensus time went backwards at event {}",
                    event.hash()
                );
            }
            tally.last_timestamp = Some(event.consensus_timestamp);
        }

        tally.rounds += 1;
        if round.is_empty() {
            tally.empty_rounds += 1;
        }
        tally.events += round.len() as u64;
        tally.transactions += round.transaction_count() as u64;
        tally.stale += round.stale.len() as u64;
        tally.last_round = Some(round.round);
        Ok(())
    }
}
