//! Chain service - the operations the engine exposes to callers

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::domain::chain::{
    ChainDefinition, ChainError, ChainEvent, ChainExecution, ChainId, ChainStepKind, DagView,
    ExecutionFilter,
};
use crate::infrastructure::chain::{
    BroadcastEventPublisher, CancelRequest, CancellationHandler, ChainExecutor, StartExecution,
};

/// Façade over the executor, the stores and the event feed
#[derive(Debug, Clone)]
pub struct ChainService {
    executor: Arc<ChainExecutor>,
    cancellation: CancellationHandler,
    events: Arc<BroadcastEventPublisher>,
}

impl ChainService {
    pub fn new(executor: Arc<ChainExecutor>, events: Arc<BroadcastEventPublisher>) -> Self {
        Self {
            cancellation: CancellationHandler::new(executor.clone()),
            executor,
            events,
        }
    }

    /// Start an execution; it advances in the background
    #[instrument(skip(self, request), fields(chain = %request.chain_name, namespace = %request.namespace, tenant = %request.tenant))]
    pub async fn create_execution(&self, request: StartExecution) -> Result<ChainId, ChainError> {
        let execution = self.executor.start(request).await?;
        Ok(execution.chain_id().clone())
    }

    pub async fn get_execution(&self, chain_id: &ChainId) -> Result<ChainExecution, ChainError> {
        self.executor
            .executions()
            .get(chain_id)
            .await?
            .ok_or_else(|| ChainError::execution_not_found(chain_id.as_str()))
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, ChainError> {
        Ok(self.executor.executions().list(filter).await?)
    }

    #[instrument(skip(self, request), fields(chain_id = %request.chain_id))]
    pub async fn cancel_execution(
        &self,
        request: CancelRequest,
    ) -> Result<ChainExecution, ChainError> {
        self.cancellation.cancel(request).await
    }

    pub async fn list_definitions(&self) -> Result<Vec<ChainDefinition>, ChainError> {
        Ok(self.executor.definitions().list().await?)
    }

    async fn definition(&self, name: &str) -> Result<ChainDefinition, ChainError> {
        self.executor
            .definitions()
            .get(name)
            .await?
            .ok_or_else(|| ChainError::definition_not_found(name))
    }

    /// Static DAG of a definition
    pub async fn definition_dag(&self, name: &str) -> Result<DagView, ChainError> {
        let definition = self.definition(name).await?;
        Ok(DagView::for_definition(&definition))
    }

    /// DAG of an execution with the progress of every spawned sub-chain
    /// expanded under its step
    pub async fn execution_dag(&self, chain_id: &ChainId) -> Result<DagView, ChainError> {
        let max_depth = self.executor.config().max_sub_chain_depth;
        self.expand(chain_id.clone(), max_depth).await
    }

    fn expand(&self, chain_id: ChainId, remaining: usize) -> BoxFuture<'_, Result<DagView, ChainError>> {
        Box::pin(async move {
            let execution = self.get_execution(&chain_id).await?;
            let definition = self.definition(execution.chain_name()).await?;
            let mut view = DagView::for_execution(&definition, &execution);

            if remaining == 0 {
                return Ok(view);
            }

            for step in definition.steps() {
                if !matches!(step.kind(), ChainStepKind::SubChain(_)) {
                    continue;
                }
                let child_id = execution
                    .steps()
                    .iter()
                    .rev()
                    .find(|record| record.name == step.name())
                    .and_then(|record| record.child_chain_id.clone());

                let Some(child_id) = child_id else {
                    continue;
                };
                match self.expand(child_id, remaining - 1).await {
                    Ok(child) => view.attach_child(step.name(), child),
                    // Child not created yet
                    Err(ChainError::ExecutionNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            Ok(view)
        })
    }

    /// Live feed of lifecycle events of every execution
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}
