//! Configuration types for Tessera

use crate::error::TesseraError;
use crate::traits::TesseraResult;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Logging level, overridden by `RUST_LOG`
    pub log_level: String,

    /// Consensus configuration
    pub consensus: ConsensusConfig,

    /// Gossip simulation configuration
    pub simulation: SimulationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "tessera-node".to_string(),
            log_level: "info".to_string(),
            consensus: ConsensusConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse from JSON text
    pub fn from_json(json: &str) -> TesseraResult<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> TesseraResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> TesseraResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> TesseraResult<()> {
        self.consensus.validate()?;
        self.simulation.validate()
    }
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Number of decided rounds whose events are still non-ancient
    pub rounds_non_ancient: u64,

    /// Number of decided rounds kept in memory before eviction
    pub rounds_expired: u64,

    /// Every `coin_freq`-th voting round of an election is a coin round
    pub coin_freq: u64,

    /// Capacity of the emitted-round channel
    ///
    /// `Consensus` publishes with `try_send`, so a subscriber that falls more
    /// than this many rounds behind misses rounds. Subscribers needing the
    /// complete stream should read the rounds `add_event` returns.
    pub round_channel_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            rounds_non_ancient: 26,
            rounds_expired: 500,
            coin_freq: 12,
            round_channel_capacity: 100,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> TesseraResult<()> {
        if self.rounds_non_ancient == 0 {
            return Err(TesseraError::ConfigError(
                "rounds_non_ancient must be at least 1".into(),
            ));
        }
        if self.rounds_expired < self.rounds_non_ancient {
            return Err(TesseraError::ConfigError(format!(
                "rounds_expired ({}) must not be below rounds_non_ancient ({})",
                self.rounds_expired, self.rounds_non_ancient
            )));
        }
        if self.coin_freq < 2 {
            return Err(TesseraError::ConfigError(
                "coin_freq must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// One address book entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberConfig {
    pub id: NodeId,
    pub weight: u64,
}

/// Shape of the simulated gossip graph
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Members take turns; each event's other parent is the previous event
    RoundRobin,
    /// Random creator, other parent is the latest event of a random peer
    RandomGossip,
}

/// Gossip simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Participants and their weights
    pub members: Vec<MemberConfig>,

    /// RNG seed, makes runs reproducible
    pub seed: u64,

    /// Number of events to generate
    pub events: usize,

    pub topology: Topology,

    /// Simulated wall-clock step between events
    pub step_millis: u64,

    /// Transactions carried by each generated event
    pub transactions_per_event: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            members: (0..4)
                .map(|i| MemberConfig {
                    id: NodeId(i),
                    weight: 1,
                })
                .collect(),
            seed: 7,
            events: 400,
            topology: Topology::RandomGossip,
            step_millis: 5,
            transactions_per_event: 1,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> TesseraResult<()> {
        if self.members.len() < 2 {
            return Err(TesseraError::ConfigError(
                "simulation needs at least two members".into(),
            ));
        }
        if self.members.iter().all(|m| m.weight == 0) {
            return Err(TesseraError::ConfigError(
                "at least one member must have non-zero weight".into(),
            ));
        }
        if self.step_millis == 0 {
            return Err(TesseraError::ConfigError("step_millis must be positive".into()));
        }
        Ok(())
    }
}
