//! Loads chain definitions from TOML
//!
//! ```toml
//! [[chains]]
//! name = "incident"
//! timeout_seconds = 600
//!
//! [[chains.steps]]
//! name = "triage"
//! type = "provider"
//! provider = "classifier"
//! action_type = "classify"
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::in_memory_definition_repository::InMemoryChainDefinitionRepository;
use crate::domain::chain::{validate_definitions, ChainDefinition, ChainError};

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    chains: Vec<ChainDefinition>,
}

/// Parse and validate a set of definitions
pub fn parse_definitions(
    source: &str,
    max_sub_chain_depth: usize,
) -> Result<Vec<ChainDefinition>, ChainError> {
    let file: DefinitionFile = toml::from_str(source)
        .map_err(|e| ChainError::validation(format!("Invalid chain definitions: {}", e)))?;

    validate_definitions(&file.chains, max_sub_chain_depth)?;
    Ok(file.chains)
}

pub fn load_definitions(
    path: impl AsRef<Path>,
    max_sub_chain_depth: usize,
) -> Result<Vec<ChainDefinition>, ChainError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| {
        ChainError::validation(format!("Cannot read {}: {}", path.display(), e))
    })?;

    let definitions = parse_definitions(&source, max_sub_chain_depth)?;
    info!(
        path = %path.display(),
        count = definitions.len(),
        "Loaded chain definitions"
    );
    Ok(definitions)
}

/// Build the definition repository from a TOML file
pub fn load_repository(
    path: impl AsRef<Path>,
    max_sub_chain_depth: usize,
) -> Result<InMemoryChainDefinitionRepository, ChainError> {
    let definitions = load_definitions(path, max_sub_chain_depth)?;
    InMemoryChainDefinitionRepository::with_definitions(definitions, max_sub_chain_depth)
}
