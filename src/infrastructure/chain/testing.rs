//! Test doubles shared by the chain runtime tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::dead_letter::InMemoryDeadLetterQueue;
use super::events::BroadcastEventPublisher;
use super::executor::{ChainExecutor, ChainExecutorConfig, StartExecution};
use super::in_memory_definition_repository::InMemoryChainDefinitionRepository;
use super::in_memory_execution_repository::InMemoryChainExecutionRepository;
use super::step_evaluator::{RetryPolicy, StepEvaluator};
use crate::domain::chain::{
    ChainDefinition, ChainExecution, ChainExecutionRepository, ChainId, ProviderDispatcher,
    ProviderRequest,
};
use crate::domain::DomainError;

#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    pub result: Result<Value, String>,
}

impl Script {
    pub fn ok(body: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(body),
        }
    }

    pub fn fail(error: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Dispatcher answering from per-action-type scripts. Scripts are consumed in
/// order and the last one repeats; unscripted actions succeed with `{}`.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<ProviderRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, action_type: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(action_type.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<ProviderRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, action_type: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.action_type == action_type)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_script(&self, action_type: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(action_type) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Script::ok(json!({}))),
            None => Script::ok(json!({})),
        }
    }
}

#[async_trait]
impl ProviderDispatcher for ScriptedDispatcher {
    async fn invoke(&self, request: ProviderRequest) -> Result<Value, DomainError> {
        self.calls.lock().unwrap().push(request.clone());
        let script = self.next_script(&request.action_type);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(script.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        script
            .result
            .map_err(|message| DomainError::provider(request.provider, message))
    }
}

pub fn evaluator(dispatcher: Arc<ScriptedDispatcher>) -> Arc<StepEvaluator> {
    Arc::new(StepEvaluator::new(dispatcher).with_retry(RetryPolicy::new(0)))
}

/// Everything a runtime test needs to drive and inspect an executor
pub struct Harness {
    pub executor: Arc<ChainExecutor>,
    pub executions: Arc<InMemoryChainExecutionRepository>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub dead_letters: Arc<InMemoryDeadLetterQueue>,
    pub events: Arc<BroadcastEventPublisher>,
}

impl Harness {
    pub fn new(definitions: Vec<ChainDefinition>, dispatcher: ScriptedDispatcher) -> Self {
        Self::with_store(
            definitions,
            dispatcher,
            Arc::new(InMemoryChainExecutionRepository::new()),
        )
    }

    /// Build a harness over an existing store, as a restarted process would
    pub fn with_store(
        definitions: Vec<ChainDefinition>,
        dispatcher: ScriptedDispatcher,
        executions: Arc<InMemoryChainExecutionRepository>,
    ) -> Self {
        let definitions = Arc::new(
            InMemoryChainDefinitionRepository::with_definitions(definitions, 8).unwrap(),
        );
        let dispatcher = Arc::new(dispatcher);
        let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
        let events = Arc::new(BroadcastEventPublisher::new(1024));

        let executor = ChainExecutor::new(
            definitions,
            executions.clone(),
            evaluator(dispatcher.clone()),
            events.clone(),
            dead_letters.clone(),
            ChainExecutorConfig::default().with_storage_retry(Duration::from_millis(20)),
        );

        Self {
            executor,
            executions,
            dispatcher,
            dead_letters,
            events,
        }
    }

    /// Start an execution and wait until its terminal event has been published
    pub async fn run(&self, request: StartExecution) -> ChainExecution {
        let mut events = self.events.subscribe();
        let execution = self.executor.start(request).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                };
                if &event.chain_id == execution.chain_id() && event.is_terminal() {
                    break;
                }
            }
        })
        .await
        .expect("execution did not finish in time");

        self.executions
            .get(execution.chain_id())
            .await
            .unwrap()
            .unwrap()
    }
}

/// Poll the store until the execution satisfies `predicate`
pub async fn wait_for_status(
    executions: &InMemoryChainExecutionRepository,
    chain_id: &ChainId,
    predicate: impl Fn(&ChainExecution) -> bool,
) -> ChainExecution {
    for _ in 0..500 {
        if let Some(execution) = executions.get(chain_id).await.unwrap() {
            if predicate(&execution) {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached the expected state", chain_id);
}

pub async fn wait_for_terminal(
    executions: &InMemoryChainExecutionRepository,
    chain_id: &ChainId,
) -> ChainExecution {
    wait_for_status(executions, chain_id, ChainExecution::is_terminal).await
}
