//! Diorama CLI - Command-line interface for the diorama harness
//!
//! Provides subcommands for inspecting the generated conductor config and
//! for smoke-testing provisioning against a real conductor.

use anyhow::Context;
use clap::{Parser, Subcommand};
use diorama::conductor::config_file::{self, ConductorFile};
use diorama::conductor::types::{BridgeConfig, InstanceConfig};
use diorama::{Conductor, ConductorConfig, RunPlan};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "diorama")]
#[command(about = "Scenario harness for a long-lived conductor process", long_about = None)]
struct Cli {
    /// Conductor binary (overrides DIORAMA_CONDUCTOR_BIN)
    #[arg(long)]
    binary: Option<String>,

    /// Pass all conductor log output through
    #[arg(long)]
    debug_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the conductor config file that would be generated
    Config {
        /// Admin interface port
        #[arg(long, default_value = "4000")]
        admin_port: u16,

        /// Persistence directory
        #[arg(long, default_value = "./diorama-storage")]
        storage: PathBuf,
    },

    /// Provision and tear down a manifest against a spawned conductor
    Smoke {
        /// JSON manifest with `instances` and optional `bridges`
        manifest: PathBuf,

        /// Number of runs
        #[arg(short, long, default_value = "2")]
        runs: usize,
    },
}

#[derive(Deserialize)]
struct Manifest {
    instances: Vec<InstanceConfig>,
    #[serde(default)]
    bridges: Vec<BridgeConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ConductorConfig::from_env();
    if let Some(binary) = cli.binary {
        config.binary = binary;
    }
    config.debug_log |= cli.debug_log;

    match cli.command {
        Commands::Config {
            admin_port,
            storage,
        } => {
            let rendered = config_file::render(&ConductorFile {
                persistence_dir: storage,
                admin_port,
                debug_log: config.debug_log,
                dpki: config.dpki.clone(),
            })?;
            print!("{rendered}");
        }

        Commands::Smoke { manifest, runs } => {
            let raw = std::fs::read_to_string(&manifest)
                .with_context(|| format!("reading {}", manifest.display()))?;
            let manifest: Manifest = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", manifest.display()))?;
            let plan = RunPlan::new(manifest.instances).with_bridges(manifest.bridges);

            let mut conductor = Conductor::new(config);
            conductor.initialize().await?;
            for _ in 0..runs {
                conductor
                    .run(&plan, |instances| async move {
                        for handle in instances.values() {
                            println!(
                                "  {} -> {} (agent {})",
                                handle.id(),
                                handle.wire_id(),
                                handle.agent_address()
                            );
                        }
                        Ok(())
                    })
                    .await?;
            }
            if let Some(nonce) = conductor.nonce() {
                println!("Completed {runs} runs, next nonce {nonce}");
            }
            conductor.kill().await;
        }
    }

    Ok(())
}
