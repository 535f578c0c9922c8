//! Sub-chain spawner: creates linked child executions

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use super::step_evaluator::StepOutcome;
use crate::domain::chain::{
    ChainDefinitionRepository, ChainError, ChainExecution, ChainExecutionRepository, ChainId,
    ChainStatus,
};
use crate::domain::DomainError;

/// Result of a spawn request
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedChild {
    pub execution: ChainExecution,
    /// False when the child already existed
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct SubChainSpawner {
    definitions: Arc<dyn ChainDefinitionRepository>,
    executions: Arc<dyn ChainExecutionRepository>,
    max_depth: usize,
}

impl SubChainSpawner {
    pub fn new(
        definitions: Arc<dyn ChainDefinitionRepository>,
        executions: Arc<dyn ChainExecutionRepository>,
        max_depth: usize,
    ) -> Self {
        Self {
            definitions,
            executions,
            max_depth,
        }
    }

    /// Create the child execution `child_id` of `parent` for its step `step`.
    ///
    /// Spawning is idempotent: if the child already exists it is returned
    /// unchanged, so a restarted parent can call this again safely.
    pub async fn spawn(
        &self,
        parent: &ChainExecution,
        step: &str,
        sub_chain: &str,
        child_id: &ChainId,
    ) -> Result<SpawnedChild, ChainError> {
        if let Some(existing) = self.executions.get(child_id).await? {
            debug!(child_chain_id = %child_id, "Sub-chain already spawned");
            return Ok(SpawnedChild {
                execution: existing,
                created: false,
            });
        }

        let depth = parent.depth() + 1;
        if depth > self.max_depth {
            return Err(ChainError::validation(format!(
                "Sub-chain '{}' would nest {} levels deep (maximum {})",
                sub_chain, depth, self.max_depth
            )));
        }

        let definition = self
            .definitions
            .get(sub_chain)
            .await?
            .ok_or_else(|| ChainError::definition_not_found(sub_chain))?;

        let child = ChainExecution::from_definition(
            &definition,
            parent.namespace(),
            parent.tenant(),
            parent.trigger_payload().clone(),
        )
        .with_id(child_id.clone())
        .with_parent(parent.chain_id().clone(), step, depth);

        let child = match self.executions.create(child).await {
            Ok(child) => child,
            Err(DomainError::Conflict { .. }) => {
                let existing = self
                    .executions
                    .get(child_id)
                    .await?
                    .ok_or_else(|| ChainError::execution_not_found(child_id.as_str()))?;
                return Ok(SpawnedChild {
                    execution: existing,
                    created: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            chain_id = %parent.chain_id(),
            child_chain_id = %child_id,
            sub_chain = %sub_chain,
            depth = depth,
            "Spawned sub-chain"
        );

        Ok(SpawnedChild {
            execution: child,
            created: true,
        })
    }

    /// Step outcome of a sub-chain step whose child reached a terminal status
    pub fn outcome_from_child(child: &ChainExecution) -> StepOutcome {
        match child.status() {
            ChainStatus::Completed => StepOutcome::success(
                child
                    .last_response_body()
                    .cloned()
                    .unwrap_or_else(|| json!({})),
                1,
            ),
            status => {
                let reason = child
                    .error()
                    .or(child.cancel_reason())
                    .map(|reason| format!(": {}", reason))
                    .unwrap_or_default();
                StepOutcome::failure(
                    format!(
                        "sub-chain '{}' ({}) ended {}{}",
                        child.chain_name(),
                        child.chain_id(),
                        status,
                        reason
                    ),
                    1,
                )
            }
        }
    }

    /// Payload recorded for a sub-chain step in a dead-letter entry
    pub fn dead_letter_payload(parent: &ChainExecution, child_id: Option<&ChainId>) -> Value {
        json!({
            "child_chain_id": child_id.map(ChainId::as_str),
            "trigger_payload": parent.trigger_payload(),
        })
    }
}
