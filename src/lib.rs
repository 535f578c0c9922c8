//! Action Gateway chain engine
//!
//! Runs named multi-step chains of provider actions with:
//! - Conditional branching on step outcomes
//! - Parallel fan-out with join and failure policies
//! - Linked sub-chain executions with cascading cancellation
//! - Per-step failure policies and a dead-letter queue
//! - Whole-execution deadlines and resumable, checkpointed state

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;

use std::sync::Arc;
use std::time::Duration;

use domain::chain::{ChainDefinition, ProviderDispatcher};
use infrastructure::{
    chain::{
        load_definitions, BroadcastEventPublisher, ChainExecutor, ChainExecutorConfig,
        InMemoryChainDefinitionRepository, InMemoryChainExecutionRepository,
        InMemoryDeadLetterQueue, StepEvaluator, TimeoutSupervisor,
    },
    provider::HttpProviderDispatcher,
    services::ChainService,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A fully wired engine over in-memory stores
#[derive(Debug, Clone)]
pub struct ChainEngine {
    pub service: ChainService,
    pub executor: Arc<ChainExecutor>,
    pub events: Arc<BroadcastEventPublisher>,
    pub dead_letters: Arc<InMemoryDeadLetterQueue>,
    pub supervisor: TimeoutSupervisor,
}

impl ChainEngine {
    /// Run the timeout supervisor until `shutdown` flips to true
    pub fn start_supervisor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.supervisor.clone().spawn(shutdown)
    }
}

/// Create the engine from configuration: definitions from
/// `engine.definitions_path`, providers over HTTP
pub async fn create_engine(config: &AppConfig) -> anyhow::Result<ChainEngine> {
    let definitions = load_definitions(
        &config.engine.definitions_path,
        config.engine.max_sub_chain_depth,
    )?;
    let dispatcher = Arc::new(HttpProviderDispatcher::from_config(&config.providers));

    create_engine_with(config, definitions, dispatcher).await
}

/// Create the engine with explicit definitions and provider dispatcher
pub async fn create_engine_with(
    config: &AppConfig,
    definitions: Vec<ChainDefinition>,
    dispatcher: Arc<dyn ProviderDispatcher>,
) -> anyhow::Result<ChainEngine> {
    let definitions = Arc::new(InMemoryChainDefinitionRepository::with_definitions(
        definitions,
        config.engine.max_sub_chain_depth,
    )?);
    let executions = Arc::new(InMemoryChainExecutionRepository::new());
    let events = Arc::new(BroadcastEventPublisher::new(
        config.engine.event_channel_capacity.max(1),
    ));
    let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
    let evaluator = Arc::new(StepEvaluator::from_config(dispatcher, &config.evaluator));

    let executor = ChainExecutor::new(
        definitions,
        executions,
        evaluator,
        events.clone(),
        dead_letters.clone(),
        ChainExecutorConfig::from(&config.engine),
    );

    let recovered = executor.recover().await?;
    info!(recovered, "Chain engine ready");

    let supervisor = TimeoutSupervisor::new(
        executor.clone(),
        Duration::from_secs(config.engine.timeout_sweep_interval_seconds.max(1)),
    );

    Ok(ChainEngine {
        service: ChainService::new(executor.clone(), events.clone()),
        executor,
        events,
        dead_letters,
        supervisor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::chain::{ChainStatus, ChainStep, ProviderStep};
    use infrastructure::chain::testing::ScriptedDispatcher;
    use infrastructure::chain::StartExecution;
    use serde_json::json;

    #[tokio::test]
    async fn test_engine_runs_chain() {
        let definitions = vec![ChainDefinition::new("hello")
            .with_step(ChainStep::provider("greet", ProviderStep::new("echo", "greet")))];
        let engine = create_engine_with(
            &AppConfig::default(),
            definitions,
            Arc::new(ScriptedDispatcher::new()),
        )
        .await
        .unwrap();

        let chain_id = engine
            .service
            .create_execution(StartExecution::new("hello", "dev", "acme", json!({})))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let supervisor = engine.start_supervisor(rx);

        let mut execution = engine.service.get_execution(&chain_id).await.unwrap();
        for _ in 0..500 {
            if execution.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            execution = engine.service.get_execution(&chain_id).await.unwrap();
        }
        assert_eq!(execution.status(), ChainStatus::Completed);
        assert!(engine.dead_letters.entries().await.is_empty());

        tx.send(true).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_definitions() {
        let definitions = vec![ChainDefinition::new("empty")];
        let result = create_engine_with(
            &AppConfig::default(),
            definitions,
            Arc::new(ScriptedDispatcher::new()),
        )
        .await;
        assert!(result.is_err());
    }
}
