//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// constraint-sync - keeps a policy engine in step with constraint resources
#[derive(Parser, Debug)]
#[command(name = "constraint-sync")]
#[command(version)]
#[command(about = "Reconcile constraint resources into a policy engine")]
#[command(
    long_about = "constraint-sync watches constraint resources, loads their rules into the policy engine, writes enforcement status back, and tracks per-action rule totals."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load manifests and run the controller until interrupted
    Run {
        /// Controller config file (TOML, JSON or YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory of constraint manifests (*.yaml, *.yml, *.json)
        #[arg(short, long)]
        manifests: PathBuf,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Controller config file (TOML, JSON or YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
