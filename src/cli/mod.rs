//! CLI module for the Action Gateway
//!
//! Provides subcommands for working with chain definitions:
//! - `validate`: check a definitions file
//! - `dag`: print the DAG view of a chain
//! - `run`: execute a chain and stream its lifecycle events

pub mod dag;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::AppConfig;
use crate::infrastructure::observability::init_tracing;

/// Action Gateway - chain orchestration for provider actions
#[derive(Parser)]
#[command(name = "action-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a chain definitions file
    Validate(DefinitionsArgs),

    /// Print the DAG view of a chain as JSON
    Dag(dag::DagArgs),

    /// Run a chain and stream its lifecycle events as JSON lines
    Run(run::RunArgs),
}

/// Location of the chain definitions
#[derive(Args, Clone, Debug)]
pub struct DefinitionsArgs {
    /// Chain definitions file (overrides `engine.definitions_path`)
    #[arg(long, short = 'd')]
    pub definitions: Option<PathBuf>,
}

impl DefinitionsArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(path) = &self.definitions {
            config.engine.definitions_path = path.display().to_string();
        }
    }
}

/// Load `.env` and the layered configuration, then install logging
pub fn load_config(definitions: &DefinitionsArgs) -> AppConfig {
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load().unwrap_or_default();
    definitions.apply(&mut config);

    init_tracing(&config.logging, &config.observability.tracing);
    config
}
