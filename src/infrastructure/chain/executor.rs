//! Chain executor: drives executions through their state machine
//!
//! Every advance of an execution runs in a spawned task that holds the
//! execution's lock and a permit of the global advance semaphore. Each step
//! attempt is checkpointed with a conditional write before the next one
//! starts, so a restarted process resumes from the persisted `current_step`.
//! Suspensions (`delay_seconds`, waiting on a child) never hold a task: they
//! end the advance and are woken by a timer or by the child's terminal
//! transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use super::parallel::ParallelCoordinator;
use super::signal::{ExecutionLocks, InFlightAdvances};
use super::step_evaluator::{StepEvaluator, StepOutcome};
use super::sub_chain::SubChainSpawner;
use crate::config::EngineConfig;
use crate::domain::chain::{
    resolve_next_step, seconds_after, sequential_next, ChainDefinition, ChainDefinitionRepository, ChainError,
    ChainEvent, ChainEventKind, ChainExecution, ChainExecutionRepository, ChainFailurePolicy,
    ChainId, ChainStatus, ChainStep, ChainStepKind, DeadLetterEntry, DeadLetterSink,
    EventPublisher, ExecutionFilter, NextStep, ParallelStep, ProviderRequest, ProviderStep,
    StepFailurePolicy, StepKind, StepRecord, TemplateContext,
};
use crate::domain::DomainError;
use crate::infrastructure::observability::{
    record_dead_letter, record_execution_finished, record_execution_started, record_step_attempt,
};

/// Trigger for a new execution
#[derive(Debug, Clone, PartialEq)]
pub struct StartExecution {
    pub chain_name: String,
    pub namespace: String,
    pub tenant: String,
    pub payload: Value,
}

impl StartExecution {
    pub fn new(
        chain_name: impl Into<String>,
        namespace: impl Into<String>,
        tenant: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            namespace: namespace.into(),
            tenant: tenant.into(),
            payload,
        }
    }
}

/// Configuration for the chain executor
#[derive(Debug, Clone)]
pub struct ChainExecutorConfig {
    /// Recorded step attempts after which an execution is failed
    pub max_steps_per_execution: usize,

    pub max_sub_chain_depth: usize,

    /// Advances running at the same time, across all executions
    pub max_concurrent_advances: usize,

    /// Delay before an advance abandoned on a storage error is retried
    pub storage_retry: Duration,
}

impl Default for ChainExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps_per_execution: 100,
            max_sub_chain_depth: 8,
            max_concurrent_advances: 16,
            storage_retry: Duration::from_secs(5),
        }
    }
}

impl ChainExecutorConfig {
    pub fn with_storage_retry(mut self, retry: Duration) -> Self {
        self.storage_retry = retry;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps_per_execution = max_steps;
        self
    }
}

impl From<&EngineConfig> for ChainExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_steps_per_execution: config.max_steps_per_execution,
            max_sub_chain_depth: config.max_sub_chain_depth,
            max_concurrent_advances: config.max_concurrent_advances.max(1),
            storage_retry: Duration::from_secs(config.storage_retry_seconds),
        }
    }
}

/// How an active execution is forced into a terminal status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Cancelled {
        reason: Option<String>,
        cancelled_by: Option<String>,
    },
    TimedOut,
}

/// An execution that was just forced into a terminal status
#[derive(Debug, Clone)]
pub struct Terminated {
    pub execution: ChainExecution,
    /// Child the execution was waiting on at the moment of termination
    pub active_child: Option<ChainId>,
}

/// What the drive loop does after one advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    /// Reload and advance again
    Continue,
    /// Wake up again at the given time
    Sleep(DateTime<Utc>),
    /// Nothing to do until something external happens
    Idle,
}

pub struct ChainExecutor {
    definitions: Arc<dyn ChainDefinitionRepository>,
    executions: Arc<dyn ChainExecutionRepository>,
    evaluator: Arc<StepEvaluator>,
    parallel: ParallelCoordinator,
    spawner: SubChainSpawner,
    events: Arc<dyn EventPublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ChainExecutorConfig,
    locks: ExecutionLocks,
    in_flight: InFlightAdvances,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl ChainExecutor {
    pub fn new(
        definitions: Arc<dyn ChainDefinitionRepository>,
        executions: Arc<dyn ChainExecutionRepository>,
        evaluator: Arc<StepEvaluator>,
        events: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ChainExecutorConfig,
    ) -> Arc<Self> {
        let spawner = SubChainSpawner::new(
            definitions.clone(),
            executions.clone(),
            config.max_sub_chain_depth,
        );

        Arc::new(Self {
            parallel: ParallelCoordinator::new(evaluator.clone()),
            spawner,
            permits: Arc::new(Semaphore::new(config.max_concurrent_advances.max(1))),
            definitions,
            executions,
            evaluator,
            events,
            dead_letters,
            config,
            locks: ExecutionLocks::default(),
            in_flight: InFlightAdvances::default(),
        })
    }

    pub fn definitions(&self) -> &Arc<dyn ChainDefinitionRepository> {
        &self.definitions
    }

    pub fn executions(&self) -> &Arc<dyn ChainExecutionRepository> {
        &self.executions
    }

    pub fn evaluator(&self) -> &Arc<StepEvaluator> {
        &self.evaluator
    }

    pub fn config(&self) -> &ChainExecutorConfig {
        &self.config
    }

    /// Create an execution of a definition and schedule its first advance
    #[instrument(skip(self, request), fields(chain = %request.chain_name))]
    pub async fn start(
        self: &Arc<Self>,
        request: StartExecution,
    ) -> Result<ChainExecution, ChainError> {
        let definition = self
            .definitions
            .get(&request.chain_name)
            .await?
            .ok_or_else(|| ChainError::definition_not_found(&request.chain_name))?;

        let execution = ChainExecution::from_definition(
            &definition,
            request.namespace,
            request.tenant,
            request.payload,
        );
        let execution = self.executions.create(execution).await?;

        record_execution_started(definition.name());
        info!(
            chain_id = %execution.chain_id(),
            namespace = %execution.namespace(),
            tenant = %execution.tenant(),
            "Chain execution started"
        );

        self.events
            .publish(ChainEvent::new(&execution, ChainEventKind::Started));
        self.schedule(execution.chain_id().clone(), execution.ready_at());

        Ok(execution)
    }

    /// Reschedule every active execution found in the store, as after a restart
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) -> Result<usize, ChainError> {
        let active = self.executions.list(&ExecutionFilter::active()).await?;

        for execution in &active {
            self.schedule(execution.chain_id().clone(), execution.ready_at());
        }

        info!(count = active.len(), "Recovered active chain executions");
        Ok(active.len())
    }

    /// Advance `chain_id` in the background, not before `at` if given
    pub fn schedule(self: &Arc<Self>, chain_id: ChainId, at: Option<DateTime<Utc>>) {
        let delay = at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default();
        self.schedule_after(chain_id, delay);
    }

    fn schedule_after(self: &Arc<Self>, chain_id: ChainId, delay: Duration) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(
                    chain_id = %chain_id,
                    delay_ms = delay.as_millis() as u64,
                    "Advance scheduled"
                );
                tokio::time::sleep(delay).await;
            }
            executor.drive(chain_id).await;
        });
    }

    /// Force an active execution into a terminal status.
    ///
    /// Retries on concurrent writes and returns `Conflict` when the execution
    /// is already terminal, so cancellation and timeout never overwrite an
    /// outcome. An advance still running for the execution is signalled and
    /// its result discarded.
    pub async fn terminate(
        self: &Arc<Self>,
        chain_id: &ChainId,
        termination: &Termination,
    ) -> Result<Terminated, ChainError> {
        loop {
            let mut execution = self
                .executions
                .get(chain_id)
                .await?
                .ok_or_else(|| ChainError::execution_not_found(chain_id.as_str()))?;

            if execution.is_terminal() {
                return Err(ChainError::conflict(format!(
                    "Execution {} is already {}",
                    chain_id,
                    execution.status()
                )));
            }

            let active_child = execution.active_child().cloned();
            match termination {
                Termination::Cancelled {
                    reason,
                    cancelled_by,
                } => execution.mark_cancelled(reason.clone(), cancelled_by.clone())?,
                Termination::TimedOut => execution.mark_timed_out()?,
            }

            match self.executions.update(execution).await {
                Ok(stored) => {
                    self.in_flight.cancel(chain_id.as_str());
                    self.on_terminal(&stored);
                    return Ok(Terminated {
                        execution: stored,
                        active_child,
                    });
                }
                Err(DomainError::Conflict { .. }) => {
                    debug!(chain_id = %chain_id, "Concurrent write while terminating, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn drive(self: Arc<Self>, chain_id: ChainId) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let _guard = self.locks.acquire(chain_id.as_str()).await;

        loop {
            match self.advance(&chain_id).await {
                Ok(Advance::Continue) => {}
                Ok(Advance::Sleep(at)) => {
                    self.schedule(chain_id, Some(at));
                    return;
                }
                Ok(Advance::Idle) => return,
                Err(e) if e.is_systemic() => {
                    warn!(
                        chain_id = %chain_id,
                        error = %e,
                        retry_in_ms = self.config.storage_retry.as_millis() as u64,
                        "Step advance abandoned"
                    );
                    self.schedule_after(chain_id, self.config.storage_retry);
                    return;
                }
                Err(e) => {
                    error!(chain_id = %chain_id, error = %e, "Step advance failed");
                    return;
                }
            }
        }
    }

    /// Run at most one step of an execution
    async fn advance(self: &Arc<Self>, chain_id: &ChainId) -> Result<Advance, ChainError> {
        let execution = self
            .executions
            .get(chain_id)
            .await?
            .ok_or_else(|| ChainError::execution_not_found(chain_id.as_str()))?;

        if execution.is_terminal() {
            return Ok(Advance::Idle);
        }

        let Some(definition) = self.definitions.get(execution.chain_name()).await? else {
            let message = format!(
                "Chain definition '{}' is no longer available",
                execution.chain_name()
            );
            return self.fail(execution, message).await;
        };

        if execution.status() == ChainStatus::WaitingSubChain {
            return self.check_child(execution, &definition).await;
        }

        if execution.is_expired(Utc::now()) {
            return match self.terminate(chain_id, &Termination::TimedOut).await {
                Ok(_) | Err(ChainError::Conflict(_)) => Ok(Advance::Idle),
                Err(e) => Err(e),
            };
        }

        if let Some(at) = execution.ready_at().filter(|at| *at > Utc::now()) {
            return Ok(Advance::Sleep(at));
        }

        if execution.steps().len() >= self.config.max_steps_per_execution {
            let message = format!(
                "Exceeded the maximum of {} step attempts",
                self.config.max_steps_per_execution
            );
            return self.fail(execution, message).await;
        }

        let index = execution.current_step();
        let Some(step) = definition.steps().get(index) else {
            let message = format!("Step index {} is out of range", index);
            return self.fail(execution, message).await;
        };

        debug!(chain_id = %chain_id, step = %step.name(), index = index, "Advancing");

        match step.kind() {
            ChainStepKind::Provider(provider) => {
                self.run_provider_step(execution, &definition, step, provider)
                    .await
            }
            ChainStepKind::Parallel(group) => {
                self.run_parallel_step(execution, &definition, step, group)
                    .await
            }
            ChainStepKind::SubChain(sub) => {
                self.enter_sub_chain(execution, &definition, step, &sub.sub_chain)
                    .await
            }
        }
    }

    async fn run_provider_step(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        definition: &ChainDefinition,
        step: &ChainStep,
        provider: &ProviderStep,
    ) -> Result<Advance, ChainError> {
        let index = execution.current_step();
        let payload = TemplateContext::new(&execution, index).render(&provider.payload_template);
        let request = origin_request(
            &execution,
            &provider.provider,
            &provider.action_type,
            payload.clone(),
        );

        let mut record = StepRecord::new(step.name(), index, StepKind::Provider)
            .with_action(&provider.provider, &provider.action_type);
        let started = Instant::now();

        let chain_id = execution.chain_id().as_str().to_string();
        let cancel = self.in_flight.register(&chain_id);
        let outcome = tokio::select! {
            outcome = self.evaluator.invoke(request) => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        self.in_flight.remove(&chain_id);

        let Some(outcome) = outcome else {
            debug!(chain_id = %chain_id, step = %step.name(), "Provider step interrupted");
            return Ok(Advance::Continue);
        };

        record_step_attempt(
            definition.name(),
            "provider",
            outcome.success,
            started.elapsed(),
        );
        apply_outcome(&mut record, outcome);
        execution.record_step(record);

        self.settle(execution, definition, payload, None).await
    }

    async fn run_parallel_step(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        definition: &ChainDefinition,
        step: &ChainStep,
        group: &ParallelStep,
    ) -> Result<Advance, ChainError> {
        let index = execution.current_step();
        let context = TemplateContext::new(&execution, index);

        let mut payloads = Map::new();
        let requests: Vec<ProviderRequest> = group
            .sub_steps
            .iter()
            .map(|sub| {
                let payload = context.render(&sub.payload_template);
                payloads.insert(sub.name.clone(), payload.clone());
                origin_request(&execution, &sub.provider, &sub.action_type, payload)
            })
            .collect();

        let mut record = StepRecord::new(step.name(), index, StepKind::Parallel);
        let started = Instant::now();

        let chain_id = execution.chain_id().as_str().to_string();
        let cancel = self.in_flight.register(&chain_id);
        let outcome = self.parallel.run(group, requests, cancel.clone()).await;
        self.in_flight.remove(&chain_id);

        if cancel.is_cancelled() {
            debug!(chain_id = %chain_id, step = %step.name(), "Parallel step interrupted");
            return Ok(Advance::Continue);
        }

        record_step_attempt(
            definition.name(),
            "parallel",
            outcome.success,
            started.elapsed(),
        );

        record.attempts = 1;
        record.sub_steps = outcome.sub_steps;
        if outcome.success {
            record.complete(Some(outcome.body));
        } else {
            record.response_body = Some(outcome.body);
            record.fail(
                outcome
                    .error
                    .unwrap_or_else(|| "parallel step failed".to_string()),
            );
        }
        execution.record_step(record);

        self.settle(execution, definition, Value::Object(payloads), None)
            .await
    }

    /// Persist the parent as waiting, then create and schedule the child.
    /// The order guarantees the child's terminal transition always finds a
    /// waiting parent to resume.
    async fn enter_sub_chain(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        definition: &ChainDefinition,
        step: &ChainStep,
        sub_chain: &str,
    ) -> Result<Advance, ChainError> {
        let child_id = ChainId::generate();
        let mut record = StepRecord::new(step.name(), execution.current_step(), StepKind::SubChain);
        record.child_chain_id = Some(child_id.clone());

        execution.record_step(record);
        execution.mark_waiting()?;

        let Some(execution) = self.persist(execution).await? else {
            return Ok(Advance::Continue);
        };

        self.events.publish(ChainEvent::new(
            &execution,
            ChainEventKind::WaitingSubChain {
                step: step.name().to_string(),
                child_chain_id: child_id.clone(),
            },
        ));

        self.spawn_child(execution, definition, step.name(), sub_chain, &child_id)
            .await
    }

    async fn spawn_child(
        self: &Arc<Self>,
        execution: ChainExecution,
        definition: &ChainDefinition,
        step: &str,
        sub_chain: &str,
        child_id: &ChainId,
    ) -> Result<Advance, ChainError> {
        match self.spawner.spawn(&execution, step, sub_chain, child_id).await {
            Ok(spawned) if spawned.execution.is_terminal() => Ok(Advance::Continue),
            Ok(spawned) => {
                if spawned.created {
                    record_execution_started(sub_chain);
                    self.events
                        .publish(ChainEvent::new(&spawned.execution, ChainEventKind::Started));
                }
                self.schedule(child_id.clone(), spawned.execution.ready_at());
                Ok(Advance::Idle)
            }
            Err(e) if e.is_systemic() => Err(e),
            Err(e) => {
                warn!(
                    chain_id = %execution.chain_id(),
                    sub_chain = %sub_chain,
                    error = %e,
                    "Sub-chain could not be spawned"
                );
                self.resume(execution, definition, StepOutcome::failure(e.to_string(), 1))
                    .await
            }
        }
    }

    /// Advance of a parent waiting on its child
    async fn check_child(
        self: &Arc<Self>,
        execution: ChainExecution,
        definition: &ChainDefinition,
    ) -> Result<Advance, ChainError> {
        let Some(child_id) = execution.active_child().cloned() else {
            return self
                .fail(execution, "Waiting on a sub-chain without an active child")
                .await;
        };

        match self.executions.get(&child_id).await? {
            Some(child) if child.is_terminal() => {
                let outcome = SubChainSpawner::outcome_from_child(&child);
                self.resume(execution, definition, outcome).await
            }
            Some(_) => Ok(Advance::Idle),
            None => {
                // Parent was checkpointed but the child never got created
                let step = definition.steps().get(execution.current_step());
                match step.map(|s| (s.name(), s.kind())) {
                    Some((name, ChainStepKind::SubChain(sub))) => {
                        let (name, sub_chain) = (name.to_string(), sub.sub_chain.clone());
                        self.spawn_child(execution, definition, &name, &sub_chain, &child_id)
                            .await
                    }
                    _ => {
                        self.fail(execution, "Waiting step is not a sub-chain step")
                            .await
                    }
                }
            }
        }
    }

    /// Close the waiting sub-chain record with the child's outcome
    async fn resume(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        definition: &ChainDefinition,
        outcome: StepOutcome,
    ) -> Result<Advance, ChainError> {
        let child_id = execution.active_child().cloned();
        execution.mark_resumed()?;

        let mut step_name = String::new();
        if let Some(record) = execution.last_step_mut() {
            let elapsed = (Utc::now() - record.started_at).to_std().unwrap_or_default();
            record_step_attempt(definition.name(), "sub_chain", outcome.success, elapsed);
            apply_outcome(record, outcome);
            step_name = record.name.clone();
        }

        let payload = SubChainSpawner::dead_letter_payload(&execution, child_id.as_ref());
        let preface = child_id.map(|child_chain_id| ChainEventKind::Resumed {
            step: step_name,
            child_chain_id,
        });

        self.settle(execution, definition, payload, preface).await
    }

    /// Apply failure policies and branching to the last recorded attempt,
    /// then checkpoint the execution
    async fn settle(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        definition: &ChainDefinition,
        payload: Value,
        preface: Option<ChainEventKind>,
    ) -> Result<Advance, ChainError> {
        let Some(record) = execution.steps().last().cloned() else {
            return self.fail(execution, "No step attempt to settle").await;
        };
        let Some(step) = definition.steps().get(record.index) else {
            return self.fail(execution, "Recorded step is out of range").await;
        };

        let mut dead_letter = None;
        let next = if record.is_success() {
            let body = record.response_body.as_ref().unwrap_or(&Value::Null);
            Some(resolve_next_step(definition, record.index, body))
        } else {
            let error = record
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());

            match step.effective_on_failure() {
                StepFailurePolicy::Skip => Some(sequential_next(definition, record.index)),
                StepFailurePolicy::Dlq => {
                    dead_letter = Some(dead_letter_entry(&execution, &record, payload, &error));
                    Some(sequential_next(definition, record.index))
                }
                StepFailurePolicy::Abort => {
                    if definition.on_failure() == ChainFailurePolicy::Abort {
                        dead_letter =
                            Some(dead_letter_entry(&execution, &record, payload, &error));
                    }
                    execution.mark_failed(format!("Step '{}' failed: {}", record.name, error))?;
                    None
                }
            }
        };

        let next_step = match next {
            Some(NextStep::Step(index)) => {
                let next = definition.steps().get(index);
                let ready_at = next
                    .and_then(ChainStep::delay_seconds)
                    .and_then(|seconds| seconds_after(Utc::now(), seconds));
                execution.set_current_step(index, ready_at);
                next.map(|step| step.name().to_string())
            }
            Some(NextStep::Complete) => {
                execution.mark_completed()?;
                None
            }
            None => None,
        };

        let Some(execution) = self.persist(execution).await? else {
            return Ok(Advance::Continue);
        };

        if let Some(entry) = dead_letter {
            self.push_dead_letter(entry).await;
        }

        if let Some(kind) = preface {
            self.events.publish(ChainEvent::new(&execution, kind));
        }

        info!(
            chain_id = %execution.chain_id(),
            step = %record.name,
            status = %record.status,
            attempts = record.attempts,
            next_step = ?next_step,
            "Step attempt recorded"
        );

        self.events.publish(ChainEvent::new(
            &execution,
            ChainEventKind::StepCompleted {
                step: record.name,
                index: record.index,
                status: record.status,
                next_step,
            },
        ));

        if execution.is_terminal() {
            self.on_terminal(&execution);
            return Ok(Advance::Idle);
        }

        Ok(Advance::Continue)
    }

    async fn fail(
        self: &Arc<Self>,
        mut execution: ChainExecution,
        message: impl Into<String>,
    ) -> Result<Advance, ChainError> {
        let message = message.into();
        warn!(chain_id = %execution.chain_id(), error = %message, "Failing chain execution");
        execution.mark_failed(message)?;

        match self.persist(execution).await? {
            Some(execution) => {
                self.on_terminal(&execution);
                Ok(Advance::Idle)
            }
            None => Ok(Advance::Continue),
        }
    }

    /// Conditional write; `None` when another writer changed the execution first
    async fn persist(
        &self,
        execution: ChainExecution,
    ) -> Result<Option<ChainExecution>, ChainError> {
        let chain_id = execution.chain_id().clone();
        match self.executions.update(execution).await {
            Ok(stored) => Ok(Some(stored)),
            Err(DomainError::Conflict { message }) => {
                debug!(chain_id = %chain_id, reason = %message, "Discarding stale step result");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push_dead_letter(&self, entry: DeadLetterEntry) {
        record_dead_letter(&entry.chain_name);
        let (chain_id, step) = (entry.chain_id.clone(), entry.step.clone());

        if let Err(e) = self.dead_letters.push(entry).await {
            error!(
                chain_id = %chain_id,
                step = %step,
                error = %e,
                "Failed to push dead-letter entry"
            );
        }
    }

    /// Terminal event, metrics and waking a waiting parent
    fn on_terminal(self: &Arc<Self>, execution: &ChainExecution) {
        if let Some(event) = ChainEvent::terminal(execution) {
            self.events.publish(event);
        }

        record_execution_finished(execution.chain_name(), execution.status().as_str());
        info!(
            chain_id = %execution.chain_id(),
            status = %execution.status(),
            steps = execution.steps().len(),
            "Chain execution finished"
        );

        self.locks.release(execution.chain_id().as_str());

        if let Some(parent_id) = execution.parent_chain_id() {
            self.schedule(parent_id.clone(), None);
        }
    }
}

fn origin_request(
    execution: &ChainExecution,
    provider: &str,
    action_type: &str,
    payload: Value,
) -> ProviderRequest {
    ProviderRequest::new(provider, action_type, payload).with_origin(
        execution.chain_id().as_str(),
        execution.namespace(),
        execution.tenant(),
    )
}

fn apply_outcome(record: &mut StepRecord, outcome: StepOutcome) {
    record.attempts = outcome.attempts;
    if outcome.success {
        record.complete(outcome.body);
    } else {
        record.fail(outcome.error.unwrap_or_else(|| "unknown error".to_string()));
    }
}

fn dead_letter_entry(
    execution: &ChainExecution,
    record: &StepRecord,
    payload: Value,
    error: &str,
) -> DeadLetterEntry {
    DeadLetterEntry {
        chain_id: execution.chain_id().to_string(),
        chain_name: execution.chain_name().to_string(),
        namespace: execution.namespace().to_string(),
        tenant: execution.tenant().to_string(),
        step: record.name.clone(),
        provider: record.provider.clone(),
        action_type: record.action_type.clone(),
        payload,
        error: error.to_string(),
        attempts: record.attempts,
        failed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain::{
        BranchCondition, BranchOperator, ParallelSubStep, StepStatus,
    };
    use crate::infrastructure::chain::dead_letter::InMemoryDeadLetterQueue;
    use crate::infrastructure::chain::events::BroadcastEventPublisher;
    use crate::infrastructure::chain::in_memory_definition_repository::InMemoryChainDefinitionRepository;
    use crate::infrastructure::chain::in_memory_execution_repository::InMemoryChainExecutionRepository;
    use crate::infrastructure::chain::testing::{
        evaluator, wait_for_status, wait_for_terminal, Harness, Script, ScriptedDispatcher,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn provider(name: &str, action: &str) -> ChainStep {
        ChainStep::provider(name, ProviderStep::new("provider", action))
    }

    fn terminal_provider(name: &str, action: &str) -> ChainStep {
        ChainStep::provider(name, ProviderStep::new("provider", action).with_default_next(""))
    }

    fn severity_chain() -> ChainDefinition {
        ChainDefinition::new("triage")
            .with_step(ChainStep::provider(
                "A",
                ProviderStep::new("classifier", "classify")
                    .with_branch(
                        BranchCondition::new("severity", BranchOperator::Eq, "B")
                            .with_value(json!("high")),
                    )
                    .with_default_next("C"),
            ))
            .with_step(terminal_provider("B", "page"))
            .with_step(terminal_provider("C", "post"))
    }

    fn start(chain: &str) -> StartExecution {
        StartExecution::new(chain, "prod", "acme", json!({"incident": 42}))
    }

    #[tokio::test]
    async fn test_branch_to_target_on_match() {
        let dispatcher =
            ScriptedDispatcher::new().script("classify", Script::ok(json!({"severity": "high"})));
        let harness = Harness::new(vec![severity_chain()], dispatcher);

        let execution = harness.run(start("triage")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.execution_path(), ["A", "B"]);
        assert_eq!(harness.dispatcher.calls_for("page"), 1);
        assert_eq!(harness.dispatcher.calls_for("post"), 0);
    }

    #[tokio::test]
    async fn test_default_next_on_no_match() {
        let dispatcher =
            ScriptedDispatcher::new().script("classify", Script::ok(json!({"severity": "low"})));
        let harness = Harness::new(vec![severity_chain()], dispatcher);

        let execution = harness.run(start("triage")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.execution_path(), ["A", "C"]);
        assert_eq!(harness.dispatcher.calls_for("page"), 0);
    }

    #[tokio::test]
    async fn test_sequential_steps_render_previous_output() {
        let chain = ChainDefinition::new("enrich")
            .with_step(provider("lookup", "lookup"))
            .with_step(ChainStep::provider(
                "notify",
                ProviderStep::new("slack", "post").with_payload_template(json!({
                    "user": "{{ prev.body.user }}",
                    "text": "Incident {{ origin.payload.incident }} in {{ origin.namespace }}"
                })),
            ));
        let dispatcher =
            ScriptedDispatcher::new().script("lookup", Script::ok(json!({"user": {"id": 7}})));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("enrich")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.steps().len(), 2);

        let calls = harness.dispatcher.calls();
        assert_eq!(
            calls[1].payload,
            json!({"user": {"id": 7}, "text": "Incident 42 in prod"})
        );
        assert_eq!(calls[1].chain_id, execution.chain_id().as_str());
        assert_eq!(calls[1].tenant, "acme");
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let chain = ChainDefinition::new("skippy")
            .with_step(provider("flaky", "flaky").with_on_failure(StepFailurePolicy::Skip))
            .with_step(provider("after", "after"));
        let dispatcher = ScriptedDispatcher::new().script("flaky", Script::fail("HTTP status 500"));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("skippy")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.execution_path(), ["flaky", "after"]);
        assert_eq!(execution.steps()[0].status, StepStatus::Failed);
        assert!(execution.steps()[0].error.as_deref().unwrap().contains("HTTP status 500"));
        assert!(harness.dead_letters.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_dlq_policy_records_and_continues() {
        let chain = ChainDefinition::new("dlq")
            .with_on_failure(ChainFailurePolicy::AbortNoDlq)
            .with_step(ChainStep::provider(
                "flaky",
                ProviderStep::new("provider", "flaky").with_payload_template(json!({"n": 1})),
            )
            .with_on_failure(StepFailurePolicy::Dlq))
            .with_step(provider("after", "after"));
        let dispatcher = ScriptedDispatcher::new().script("flaky", Script::fail("rejected"));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("dlq")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        let entries = harness.dead_letters.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].step, "flaky");
        assert_eq!(entries[0].payload, json!({"n": 1}));
        assert_eq!(entries[0].chain_id, execution.chain_id().as_str());
    }

    #[tokio::test]
    async fn test_abort_fails_chain_and_dead_letters() {
        let chain = ChainDefinition::new("strict")
            .with_step(provider("first", "first"))
            .with_step(provider("second", "second"));
        let dispatcher = ScriptedDispatcher::new().script("first", Script::fail("boom"));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("strict")).await;

        assert_eq!(execution.status(), ChainStatus::Failed);
        assert!(execution.error().unwrap().contains("Step 'first' failed"));
        assert_eq!(execution.execution_path(), ["first"]);
        assert_eq!(harness.dispatcher.calls_for("second"), 0);
        assert_eq!(harness.dead_letters.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_no_dlq_suppresses_dead_letter() {
        let chain = ChainDefinition::new("quiet")
            .with_on_failure(ChainFailurePolicy::AbortNoDlq)
            .with_step(provider("first", "first"));
        let dispatcher = ScriptedDispatcher::new().script("first", Script::fail("boom"));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("quiet")).await;

        assert_eq!(execution.status(), ChainStatus::Failed);
        assert!(harness.dead_letters.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_delay_holds_step_without_blocking() {
        let chain = ChainDefinition::new("delayed")
            .with_step(provider("first", "first"))
            .with_step(provider("second", "second").with_delay_seconds(1));
        let harness = Harness::new(vec![chain], ScriptedDispatcher::new());

        let started = Instant::now();
        let execution = harness.executor.start(start("delayed")).await.unwrap();

        let waiting = wait_for_status(&harness.executions, execution.chain_id(), |e| {
            e.current_step() == 1
        })
        .await;
        assert_eq!(waiting.status(), ChainStatus::Running);
        assert!(waiting.ready_at().is_some());
        assert_eq!(harness.dispatcher.calls_for("second"), 0);

        let finished = wait_for_terminal(&harness.executions, execution.chain_id()).await;
        assert_eq!(finished.status(), ChainStatus::Completed);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(finished.ready_at(), None);
    }

    #[tokio::test]
    async fn test_parallel_step_inside_chain() {
        let chain = ChainDefinition::new("fan")
            .with_step(ChainStep::parallel(
                "notify",
                ParallelStep::new(vec![
                    ParallelSubStep::new("slack", "slack", "post"),
                    ParallelSubStep::new("email", "smtp", "send"),
                ]),
            ))
            .with_step(ChainStep::provider(
                "audit",
                ProviderStep::new("audit", "record")
                    .with_payload_template(json!({"ts": "{{ steps.notify.body.slack.ts }}"})),
            ));
        let dispatcher = ScriptedDispatcher::new().script("post", Script::ok(json!({"ts": "99"})));
        let harness = Harness::new(vec![chain], dispatcher);

        let execution = harness.run(start("fan")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.steps()[0].sub_steps.len(), 2);
        let audit = harness
            .dispatcher
            .calls()
            .into_iter()
            .find(|c| c.action_type == "record")
            .unwrap();
        assert_eq!(audit.payload, json!({"ts": "99"}));
    }

    #[tokio::test]
    async fn test_sub_chain_completes_parent() {
        let child = ChainDefinition::new("paging").with_step(provider("page", "page"));
        let parent = ChainDefinition::new("incident")
            .with_step(ChainStep::sub_chain("escalate", "paging"))
            .with_step(ChainStep::provider(
                "close",
                ProviderStep::new("provider", "close")
                    .with_payload_template(json!({"ack": "{{ steps.escalate.body.ack }}"})),
            ));
        let dispatcher = ScriptedDispatcher::new().script("page", Script::ok(json!({"ack": true})));
        let harness = Harness::new(vec![child, parent], dispatcher);

        let execution = harness.run(start("incident")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(execution.execution_path(), ["escalate", "close"]);

        let record = &execution.steps()[0];
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.response_body, Some(json!({"ack": true})));

        let child_id = record.child_chain_id.clone().unwrap();
        let child = harness.executions.get(&child_id).await.unwrap().unwrap();
        assert_eq!(child.status(), ChainStatus::Completed);
        assert_eq!(child.parent_chain_id(), Some(execution.chain_id()));
        assert_eq!(child.depth(), 1);
        assert_eq!(child.trigger_payload(), &json!({"incident": 42}));

        let close = harness.dispatcher.calls().into_iter().find(|c| c.action_type == "close");
        assert_eq!(close.unwrap().payload, json!({"ack": true}));
    }

    #[tokio::test]
    async fn test_sub_chain_failure_applies_parent_policy() {
        let child = ChainDefinition::new("paging").with_step(provider("page", "page"));
        let parent = ChainDefinition::new("incident")
            .with_on_failure(ChainFailurePolicy::AbortNoDlq)
            .with_step(ChainStep::sub_chain("escalate", "paging"))
            .with_step(provider("close", "close"));
        let dispatcher = ScriptedDispatcher::new().script("page", Script::fail("pager down"));
        let harness = Harness::new(vec![child, parent], dispatcher);

        let execution = harness.run(start("incident")).await;

        assert_eq!(execution.status(), ChainStatus::Failed);
        let record = &execution.steps()[0];
        assert_eq!(record.status, StepStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("ended failed"));
        assert_eq!(harness.dispatcher.calls_for("close"), 0);

        // The child's own abort still dead-letters under its default policy
        assert_eq!(harness.dead_letters.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sub_chain_failure_can_be_skipped() {
        let child = ChainDefinition::new("paging")
            .with_on_failure(ChainFailurePolicy::AbortNoDlq)
            .with_step(provider("page", "page"));
        let parent = ChainDefinition::new("incident")
            .with_step(
                ChainStep::sub_chain("escalate", "paging").with_on_failure(StepFailurePolicy::Skip),
            )
            .with_step(provider("close", "close"));
        let dispatcher = ScriptedDispatcher::new().script("page", Script::fail("pager down"));
        let harness = Harness::new(vec![child, parent], dispatcher);

        let execution = harness.run(start("incident")).await;

        assert_eq!(execution.status(), ChainStatus::Completed);
        assert_eq!(harness.dispatcher.calls_for("close"), 1);
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_step() {
        let chain = ChainDefinition::new("two")
            .with_step(provider("first", "first"))
            .with_step(provider("second", "second"));

        // Checkpoint left by a process that finished the first step
        let executions = Arc::new(InMemoryChainExecutionRepository::new());
        let mut execution =
            ChainExecution::from_definition(&chain, "prod", "acme", json!({"incident": 1}));
        let mut record = StepRecord::new("first", 0, StepKind::Provider);
        record.complete(Some(json!({"done": true})));
        execution.record_step(record);
        execution.set_current_step(1, None);
        let execution = executions.create(execution).await.unwrap();

        let json = serde_json::to_string(&execution).unwrap();
        let reloaded: ChainExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.current_step(), 1);

        let harness = Harness::with_store(vec![chain], ScriptedDispatcher::new(), executions);
        assert_eq!(harness.executor.recover().await.unwrap(), 1);

        let finished = wait_for_terminal(&harness.executions, execution.chain_id()).await;
        assert_eq!(finished.status(), ChainStatus::Completed);
        assert_eq!(finished.execution_path(), ["first", "second"]);
        assert_eq!(harness.dispatcher.calls_for("first"), 0);
        assert_eq!(harness.dispatcher.calls_for("second"), 1);
    }

    #[tokio::test]
    async fn test_recover_spawns_missing_child() {
        let child = ChainDefinition::new("paging").with_step(provider("page", "page"));
        let parent = ChainDefinition::new("incident")
            .with_step(ChainStep::sub_chain("escalate", "paging"));

        // Parent persisted as waiting, crash before the child was created
        let executions = Arc::new(InMemoryChainExecutionRepository::new());
        let mut execution = ChainExecution::from_definition(&parent, "prod", "acme", json!({}));
        let mut record = StepRecord::new("escalate", 0, StepKind::SubChain);
        record.child_chain_id = Some(ChainId::generate());
        execution.record_step(record);
        execution.mark_waiting().unwrap();
        let execution = executions.create(execution).await.unwrap();

        let harness =
            Harness::with_store(vec![child, parent], ScriptedDispatcher::new(), executions);
        harness.executor.recover().await.unwrap();

        let finished = wait_for_terminal(&harness.executions, execution.chain_id()).await;
        assert_eq!(finished.status(), ChainStatus::Completed);
        assert_eq!(harness.dispatcher.calls_for("page"), 1);
    }

    #[tokio::test]
    async fn test_loop_guard_fails_execution() {
        let chain = ChainDefinition::new("loop").with_step(ChainStep::provider(
            "again",
            ProviderStep::new("provider", "again").with_default_next("again"),
        ));
        let harness = Harness::new(vec![chain], ScriptedDispatcher::new());

        let execution = harness.run(start("loop")).await;

        assert_eq!(execution.status(), ChainStatus::Failed);
        assert!(execution.error().unwrap().contains("maximum of 100 step attempts"));
        assert_eq!(execution.steps().len(), 100);
        assert_eq!(harness.dispatcher.calls_for("again"), 100);
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let chain = ChainDefinition::new("one").with_step(provider("only", "only"));
        let harness = Harness::new(vec![chain], ScriptedDispatcher::new());
        let mut events = harness.events.subscribe();

        let execution = harness.run(start("one")).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(&event.chain_id, execution.chain_id());
            kinds.push(event.kind);
        }

        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0], ChainEventKind::Started);
        assert!(matches!(
            &kinds[1],
            ChainEventKind::StepCompleted { step, next_step: None, status: StepStatus::Completed, .. } if step == "only"
        ));
        assert_eq!(kinds[2], ChainEventKind::Completed);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_rejected() {
        let harness = Harness::new(vec![severity_chain()], ScriptedDispatcher::new());
        let result = harness.executor.start(start("missing")).await;
        assert!(matches!(result, Err(ChainError::DefinitionNotFound(_))));
    }

    /// Store whose first conditional writes fail as if the backend were down
    #[derive(Debug)]
    struct FlakyStore {
        inner: InMemoryChainExecutionRepository,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ChainExecutionRepository for FlakyStore {
        async fn get(&self, id: &ChainId) -> Result<Option<ChainExecution>, DomainError> {
            self.inner.get(id).await
        }

        async fn create(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError> {
            self.inner.create(execution).await
        }

        async fn update(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DomainError::storage("connection reset"));
            }
            self.inner.update(execution).await
        }

        async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ChainExecution>, DomainError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test]
    async fn test_storage_error_reschedules_advance() {
        let chain = ChainDefinition::new("one").with_step(provider("only", "only"));
        let definitions =
            Arc::new(InMemoryChainDefinitionRepository::with_definitions(vec![chain], 8).unwrap());
        let inner = InMemoryChainExecutionRepository::new();
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures_left: AtomicUsize::new(2),
        });
        let dispatcher = Arc::new(ScriptedDispatcher::new());

        let executor = ChainExecutor::new(
            definitions,
            store,
            evaluator(dispatcher.clone()),
            Arc::new(BroadcastEventPublisher::default()),
            Arc::new(InMemoryDeadLetterQueue::new()),
            ChainExecutorConfig::default().with_storage_retry(Duration::from_millis(10)),
        );

        let execution = executor.start(start("one")).await.unwrap();
        let finished = wait_for_terminal(&inner, execution.chain_id()).await;

        assert_eq!(finished.status(), ChainStatus::Completed);
        assert_eq!(finished.steps().len(), 1);
        // The abandoned attempts were never checkpointed
        assert_eq!(dispatcher.calls_for("only"), 3);
    }

    /// Store where an operator cancels the execution just before the first
    /// step checkpoint is written
    #[derive(Debug)]
    struct CancelBeforeCheckpointStore {
        inner: InMemoryChainExecutionRepository,
        cancelled: AtomicBool,
    }

    #[async_trait]
    impl ChainExecutionRepository for CancelBeforeCheckpointStore {
        async fn get(&self, id: &ChainId) -> Result<Option<ChainExecution>, DomainError> {
            self.inner.get(id).await
        }

        async fn create(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError> {
            self.inner.create(execution).await
        }

        async fn update(&self, execution: ChainExecution) -> Result<ChainExecution, DomainError> {
            if !execution.steps().is_empty() && !self.cancelled.swap(true, Ordering::SeqCst) {
                let mut stored = self.inner.get(execution.chain_id()).await?.unwrap();
                stored
                    .mark_cancelled(Some("operator".to_string()), Some("ops".to_string()))
                    .unwrap();
                self.inner.update(stored).await?;
            }
            self.inner.update(execution).await
        }

        async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ChainExecution>, DomainError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test]
    async fn test_step_finishing_after_cancel_is_discarded() {
        let chain = ChainDefinition::new("race")
            .with_step(provider("first", "first"))
            .with_step(provider("second", "second"));
        let definitions =
            Arc::new(InMemoryChainDefinitionRepository::with_definitions(vec![chain], 8).unwrap());
        let inner = InMemoryChainExecutionRepository::new();
        let store = Arc::new(CancelBeforeCheckpointStore {
            inner: inner.clone(),
            cancelled: AtomicBool::new(false),
        });
        let dispatcher = Arc::new(ScriptedDispatcher::new());

        let executor = ChainExecutor::new(
            definitions,
            store.clone(),
            evaluator(dispatcher.clone()),
            Arc::new(BroadcastEventPublisher::default()),
            Arc::new(InMemoryDeadLetterQueue::new()),
            ChainExecutorConfig::default(),
        );

        let execution = executor.start(start("race")).await.unwrap();
        let finished = wait_for_terminal(&inner, execution.chain_id()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.cancelled.load(Ordering::SeqCst));
        let stored = inner.get(execution.chain_id()).await.unwrap().unwrap();
        assert_eq!(finished.status(), ChainStatus::Cancelled);
        assert_eq!(stored.status(), ChainStatus::Cancelled);
        assert_eq!(stored.cancel_reason(), Some("operator"));
        assert!(stored.steps().is_empty());
        assert!(stored.execution_path().is_empty());
        assert_eq!(dispatcher.calls_for("first"), 1);
        assert_eq!(dispatcher.calls_for("second"), 0);
    }

    #[tokio::test]
    async fn test_expired_execution_is_not_advanced() {
        let chain = ChainDefinition::new("slow")
            .with_timeout_seconds(60)
            .with_step(provider("only", "only"));

        let executions = Arc::new(InMemoryChainExecutionRepository::new());
        let execution = ChainExecution::from_definition(&chain, "prod", "acme", json!({}))
            .with_started_at(Utc::now() - chrono::Duration::seconds(61), Some(60));
        let execution = executions.create(execution).await.unwrap();

        let harness = Harness::with_store(vec![chain], ScriptedDispatcher::new(), executions);
        harness.executor.recover().await.unwrap();

        let finished = wait_for_terminal(&harness.executions, execution.chain_id()).await;
        assert_eq!(finished.status(), ChainStatus::TimedOut);
        assert_eq!(harness.dispatcher.calls_for("only"), 0);
    }
}
