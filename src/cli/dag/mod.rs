//! DAG command - prints the static DAG view of a chain

use clap::Args;

use super::{load_config, DefinitionsArgs};
use crate::domain::chain::{ChainError, DagView};
use crate::infrastructure::chain::load_definitions;

#[derive(Args, Clone, Debug)]
pub struct DagArgs {
    /// Name of the chain to render
    pub chain: String,

    #[command(flatten)]
    pub definitions: DefinitionsArgs,
}

pub async fn run(args: DagArgs) -> anyhow::Result<()> {
    let config = load_config(&args.definitions);

    let definitions = load_definitions(
        &config.engine.definitions_path,
        config.engine.max_sub_chain_depth,
    )?;

    let definition = definitions
        .iter()
        .find(|d| d.name() == args.chain)
        .ok_or_else(|| ChainError::definition_not_found(&args.chain))?;

    let view = DagView::for_definition(definition);
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
