//! Validate command - loads and validates a definitions file

use tracing::info;

use super::{load_config, DefinitionsArgs};
use crate::infrastructure::chain::load_definitions;

pub async fn run(args: DefinitionsArgs) -> anyhow::Result<()> {
    let config = load_config(&args);

    let definitions = load_definitions(
        &config.engine.definitions_path,
        config.engine.max_sub_chain_depth,
    )?;

    for definition in &definitions {
        info!(
            chain = %definition.name(),
            version = definition.version(),
            steps = definition.steps().len(),
            "Definition valid"
        );
        println!(
            "{} v{} ({} steps)",
            definition.name(),
            definition.version(),
            definition.steps().len()
        );
    }

    println!(
        "{} chain definitions in {} are valid",
        definitions.len(),
        config.engine.definitions_path
    );
    Ok(())
}
