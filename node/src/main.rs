//! Tessera Node Binary

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tessera_core::{NodeConfig, Topology};
use tessera_node::SimulationBuilder;
use tessera_state::ConsensusSnapshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tessera-node")]
#[command(about = "Tessera - hashgraph consensus simulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TopologyArg {
    RoundRobin,
    RandomGossip,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::RoundRobin => Topology::RoundRobin,
            TopologyArg::RandomGossip => Topology::RandomGossip,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gossip simulation through the consensus engine
    Simulate {
        /// Configuration file path (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of events to generate
        #[arg(short, long)]
        events: Option<usize>,

        /// RNG seed of the generated graph
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, value_enum)]
        topology: Option<TopologyArg>,

        /// Deliver events in a random topological order
        #[arg(long)]
        shuffle: Option<u64>,

        /// Write the latest consensus snapshot here
        #[arg(long)]
        snapshot_out: Option<PathBuf>,

        /// Resume from a previously written snapshot
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Print the default configuration
    DefaultConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Verify a snapshot file and print its contents
    InspectSnapshot {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            events,
            seed,
            topology,
            shuffle,
            snapshot_out,
            resume,
        } => {
            let config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            init_logging(&config.log_level);

            let mut builder = SimulationBuilder::new().config(config);
            if let Some(events) = events {
                builder = builder.events(events);
            }
            if let Some(seed) = seed {
                builder = builder.seed(seed);
            }
            if let Some(topology) = topology {
                builder = builder.topology(topology.into());
            }
            if let Some(seed) = shuffle {
                builder = builder.shuffle(seed);
            }
            if let Some(path) = resume {
                let snapshot = read_snapshot(&path)?;
                info!("Loaded snapshot of round {} from {}", snapshot.decided_round(), path.display());
                builder = builder.resume(snapshot);
            }

            let runtime = builder.build()?;
            let snapshots = runtime.snapshots().clone();
            let report = runtime.run().await?;

            if let Some(path) = snapshot_out {
                match snapshots.latest() {
                    Some(snapshot) => {
                        write_snapshot(&path, &snapshot)?;
                        info!("Snapshot of round {} saved to {}", snapshot.decided_round(), path.display());
                    }
                    None => info!("No round reached consensus, no snapshot written"),
                }
            }

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::DefaultConfig { output } => {
            let json = NodeConfig::default().to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Configuration saved to: {}", path.display());
                }
                None => println!("{}", json),
            }
        }

        Commands::InspectSnapshot { path } => {
            let snapshot = read_snapshot(&path)?;
            snapshot.verify()?;
            println!("{}", snapshot.to_json()?);
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn is_json(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

/// Snapshots are bincode unless the file ends in `.json`
fn read_snapshot(path: &Path) -> anyhow::Result<ConsensusSnapshot> {
    let snapshot = if is_json(path) {
        ConsensusSnapshot::from_json(&std::fs::read_to_string(path)?)?
    } else {
        ConsensusSnapshot::from_bytes(&std::fs::read(path)?)?
    };
    Ok(snapshot)
}

fn write_snapshot(path: &Path, snapshot: &ConsensusSnapshot) -> anyhow::Result<()> {
    if is_json(path) {
        std::fs::write(path, snapshot.to_json()?)?;
    } else {
        std::fs::write(path, snapshot.to_bytes()?)?;
    }
    Ok(())
}
