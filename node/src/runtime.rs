//! Simulation runtime driving the consensus engine

use crate::sink::{LogSink, RoundSink, SnapshotSink, Tally, TallySink};
use serde::Serialize;
use std::sync::Arc;
use tessera_consensus::{
    create_round_channel, shuffle_topologically, AddressBook, Consensus, ConsensusStats,
    GraphGenerator,
};
use tessera_core::{NodeConfig, Round, Topology};
use tessera_state::ConsensusSnapshot;
use tracing::{debug, info};

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub name: String,
    pub members: usize,
    pub topology: Topology,
    pub seed: u64,
    pub events_generated: usize,
    pub events_added: usize,
    pub events_rejected: usize,
    /// Events skipped because they were ancient in the resumed snapshot
    pub events_skipped: usize,
    pub resumed_from: Option<Round>,
    pub tally: Tally,
    pub stats: ConsensusStats,
    pub latest_snapshot_round: Option<Round>,
}

/// Feeds a generated gossip graph through a consensus instance
///
/// The rounds returned by each `add_event` call are forwarded over a bounded
/// channel to a consumer task that hands them to every registered sink. The
/// forwarding send waits for room, so a slow sink throttles the feed instead
/// of losing rounds.
pub struct SimulationRuntime {
    config: NodeConfig,
    sinks: Vec<Arc<dyn RoundSink>>,
    snapshots: Arc<SnapshotSink>,
    tally: Arc<TallySink>,
    resume: Option<ConsensusSnapshot>,
    shuffle_seed: Option<u64>,
}

impl SimulationRuntime {
    pub fn new(config: NodeConfig) -> Self {
        let snapshots = Arc::new(SnapshotSink::new(config.consensus.rounds_non_ancient as usize));
        let tally = Arc::new(TallySink::new());
        Self {
            config,
            sinks: vec![Arc::new(LogSink), snapshots.clone(), tally.clone()],
            snapshots,
            tally,
            resume: None,
            shuffle_seed: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Snapshots kept while the simulation runs
    pub fn snapshots(&self) -> &Arc<SnapshotSink> {
        &self.snapshots
    }

    /// Run the whole simulation to completion
    pub async fn run(self) -> anyhow::Result<SimulationReport> {
        let simulation = &self.config.simulation;
        let book = Arc::new(AddressBook::from_config(&simulation.members)?);
        let consensus = Consensus::new(self.config.consensus.clone(), book)?;

        let (tx, mut rx) = create_round_channel(self.config.consensus.round_channel_capacity);

        let sinks = self.sinks.clone();
        let consumer = tokio::spawn(async move {
            while let Some(round) = rx.recv().await {
                for sink in &sinks {
                    sink.on_round(&round).await?;
                }
            }
            Ok::<_, anyhow::Error>(())
        });

        let resumed_from = match &self.resume {
            Some(snapshot) => {
                let round = snapshot.decided_round();
                for replayed in consensus.load_snapshot(snapshot.clone())? {
                    if tx.send(replayed).await.is_err() {
                        break;
                    }
                }
                info!("Resumed from snapshot of round {}", round);
                Some(round)
            }
            None => None,
        };
        let ancient = consensus.ancient_generation();

        let mut events = GraphGenerator::from_config(simulation).generate(simulation.events);
        let events_generated = events.len();
        if let Some(seed) = self.shuffle_seed {
            events = shuffle_topologically(&events, seed);
        }

        info!(
            "Simulating {} events among {} members ({:?})",
            events_generated,
            simulation.members.len(),
            simulation.topology
        );

        let mut added = 0;
        let mut rejected = 0;
        let mut skipped = 0;
        for event in events {
            if resumed_from.is_some() && event.generation < ancient {
                skipped += 1;
                continue;
            }
            match consensus.add_event(event) {
                Ok(rounds) => {
                    added += 1;
                    if !rounds.is_empty() {
                        debug!("{} round(s) decided, max round {}", rounds.len(), consensus.max_round());
                    }
                    for round in rounds {
                        if tx.send(round).await.is_err() {
                            // the consumer stopped on a sink error, surfaced below
                            break;
                        }
                    }
                }
                Err(e) if e.is_rejection() => rejected += 1,
                Err(e) => return Err(e.into()),
            }
            tokio::task::yield_now().await;
        }

        let stats = consensus.stats();
        // closes the round channel so the consumer drains and stops
        drop(tx);
        consumer.await??;

        let tally = self.tally.tally();
        info!(
            "Simulation finished: {} rounds, {} events ordered, {} transactions",
            tally.rounds, tally.events, tally.transactions
        );

        Ok(SimulationReport {
            name: self.config.name.clone(),
            members: simulation.members.len(),
            topology: simulation.topology,
            seed: simulation.seed,
            events_generated,
            events_added: added,
            events_rejected: rejected,
            events_skipped: skipped,
            resumed_from,
            tally,
            stats,
            latest_snapshot_round: self.snapshots.latest().map(|s| s.decided_round()),
        })
    }
}

/// Builder for [`SimulationRuntime`]
pub struct SimulationBuilder {
    config: NodeConfig,
    extra_sinks: Vec<Arc<dyn RoundSink>>,
    resume: Option<ConsensusSnapshot>,
    shuffle_seed: Option<u64>,
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            extra_sinks: Vec::new(),
            resume: None,
            shuffle_seed: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: usize) -> Self {
        self.config.simulation.events = events;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.simulation.seed = seed;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.config.simulation.topology = topology;
        self
    }

    /// Deliver events in a random topological order instead of creation order
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn resume(mut self, snapshot: ConsensusSnapshot) -> Self {
        self.resume = Some(snapshot);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RoundSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub fn build(self) -> anyhow::Result<SimulationRuntime> {
        self.config.validate()?;
        let mut runtime = SimulationRuntime::new(self.config);
        runtime.sinks.extend(self.extra_sinks);
        runtime.resume = self.resume;
        runtime.shuffle_seed = self.shuffle_seed;
        Ok(runtime)
    }
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ConsensusConfig;

    fn config(topology: Topology, events: usize) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.consensus = ConsensusConfig {
            rounds_non_ancient: 3,
            ..Default::default()
        };
        config.simulation.topology = topology;
        config.simulation.events = events;
        config
    }

    #[tokio::test]
    async fn test_simulation_decides_rounds() {
        let report = SimulationBuilder::new()
            .config(config(Topology::RandomGossip, 300))
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.events_generated, 300);
        assert_eq!(report.events_added, 300);
        assert_eq!(report.events_rejected, 0);
        assert!(report.tally.rounds > 3);
        assert_eq!(report.tally.last_round, Some(report.stats.fame_decided_below - 1));
        assert_eq!(report.tally.events, report.stats.next_consensus_order);
        assert_eq!(report.latest_snapshot_round, report.tally.last_round);
    }

    #[tokio::test]
    async fn test_shuffled_delivery_reaches_same_order() {
        let plain = SimulationBuilder::new()
            .config(config(Topology::RandomGossip, 200))
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();
        let shuffled = SimulationBuilder::new()
            .config(config(Topology::RandomGossip, 200))
            .shuffle(99)
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(plain.tally.rounds, shuffled.tally.rounds);
        assert_eq!(plain.tally.events, shuffled.tally.events);
        assert_eq!(plain.tally.last_timestamp, shuffled.tally.last_timestamp);
    }

    #[tokio::test]
    async fn test_resume_from_snapshot() {
        let first = SimulationBuilder::new()
            .config(config(Topology::RoundRobin, 40))
            .build()
            .unwrap();
        let snapshots = first.snapshots().clone();
        let report = first.run().await.unwrap();
        let snapshot = snapshots.latest().unwrap();
        assert_eq!(Some(snapshot.decided_round()), report.tally.last_round);

        let resumed = SimulationBuilder::new()
            .config(config(Topology::RoundRobin, 80))
            .resume(snapshot.clone())
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(resumed.resumed_from, Some(snapshot.decided_round()));
        assert!(resumed.events_skipped > 0);
        assert_eq!(resumed.events_rejected, 0);
        assert!(resumed.tally.rounds > 0);
        assert_eq!(resumed.stats.fame_decided_below, resumed.tally.last_round.unwrap() + 1);
    }

    #[tokio::test]
    async fn test_single_slot_channel_delivers_every_round() {
        let mut config = config(Topology::RandomGossip, 400);
        config.consensus.round_channel_capacity = 1;
        let report = SimulationBuilder::new()
            .config(config)
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();

        assert!(report.tally.rounds > 3);
        assert_eq!(report.tally.rounds as i64, report.stats.fame_decided_below - 1);
        assert_eq!(report.tally.last_round, Some(report.stats.fame_decided_below - 1));
        assert_eq!(report.tally.events, report.stats.next_consensus_order);
    }

    #[tokio::test]
    async fn test_sink_error_fails_the_run() {
        struct Failing;

        #[async_trait::async_trait]
        impl RoundSink for Failing {
            async fn on_round(&self, round: &tessera_consensus::ConsensusRound) -> anyhow::Result<()> {
                anyhow::ensure!(round.round < 2, "refusing round {}", round.round);
                Ok(())
            }
        }

        let result = SimulationBuilder::new()
            .config(config(Topology::RoundRobin, 60))
            .sink(Arc::new(Failing))
            .build()
            .unwrap()
            .run()
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = NodeConfig::default();
        config.simulation.members.truncate(1);
        assert!(SimulationBuilder::new().config(config).build().is_err());
    }
}
