//! Chain execution entities

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::ChainDefinition;
use super::error::ChainError;

/// Regex pattern for valid execution IDs: chain-{uuid}
static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^chain-[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$").unwrap()
});

/// `from + seconds`, or `None` when the result is not representable
pub fn seconds_after(from: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| from.checked_add_signed(delta))
}

/// Validated execution identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Result<Self, ChainError> {
        let id = id.into();
        if !ID_PATTERN.is_match(&id) {
            return Err(ChainError::validation(format!(
                "Invalid chain ID '{}': must be in format chain-{{uuid}}",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(format!("chain-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChainId {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Running,
    WaitingSubChain,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Running or waiting on a child
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, target: ChainStatus) -> bool {
        match (self, target) {
            (Self::Running, _) => true,

            (Self::WaitingSubChain, Self::Running) => true,
            (Self::WaitingSubChain, Self::Failed) => true,
            (Self::WaitingSubChain, Self::Cancelled) => true,
            (Self::WaitingSubChain, Self::TimedOut) => true,

            // Terminal states cannot transition
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingSubChain => "waiting_sub_chain",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainStatus {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting_sub_chain" => Ok(Self::WaitingSubChain),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(ChainError::validation(format!(
                "Unknown chain status '{}'",
                other
            ))),
        }
    }
}

/// Status of a single step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Provider,
    SubChain,
    Parallel,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider => write!(f, "provider"),
            Self::SubChain => write!(f, "sub_chain"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Result record for one visited step (or one parallel sub-step)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,

    /// Position of the step in its definition (or in its parallel group)
    pub index: usize,

    pub kind: StepKind,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,

    #[serde(default)]
    pub attempts: u32,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,

    /// Parallel sub-step results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<StepRecord>,

    /// Linked child execution of a sub-chain step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_chain_id: Option<ChainId>,
}

impl StepRecord {
    pub fn new(name: impl Into<String>, index: usize, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            index,
            kind,
            status: StepStatus::Running,
            provider: None,
            action_type: None,
            attempts: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            response_body: None,
            sub_steps: Vec::new(),
            child_chain_id: None,
        }
    }

    pub fn with_action(mut self, provider: impl Into<String>, action_type: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.action_type = Some(action_type.into());
        self
    }

    pub fn complete(&mut self, body: Option<Value>) {
        self.status = StepStatus::Completed;
        self.response_body = body;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish_with(StepStatus::Failed, Some(error.into()));
    }

    /// Close the record with a non-success status
    pub fn finish_with(&mut self, status: StepStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// A running or historical instance of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecution {
    chain_id: ChainId,

    chain_name: String,

    namespace: String,

    tenant: String,

    /// Payload of the trigger that created the execution
    trigger_payload: Value,

    status: ChainStatus,

    current_step: usize,

    total_steps: usize,

    execution_path: Vec<String>,

    steps: Vec<StepRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_chain_id: Option<ChainId>,

    /// Step of the parent that spawned this execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_step: Option<String>,

    /// Sub-chain nesting level, 0 for root executions
    #[serde(default)]
    depth: usize,

    started_at: DateTime<Utc>,

    updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,

    /// Pending `delay_seconds` wake-up for the current step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cancel_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cancelled_by: Option<String>,

    /// Compare-and-swap token maintained by the execution store
    #[serde(default)]
    revision: u64,
}

impl ChainExecution {
    pub fn new(
        chain_name: impl Into<String>,
        namespace: impl Into<String>,
        tenant: impl Into<String>,
        trigger_payload: Value,
        total_steps: usize,
        timeout_seconds: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            chain_id: ChainId::generate(),
            chain_name: chain_name.into(),
            namespace: namespace.into(),
            tenant: tenant.into(),
            trigger_payload,
            status: ChainStatus::Running,
            current_step: 0,
            total_steps,
            execution_path: Vec::new(),
            steps: Vec::new(),
            parent_chain_id: None,
            parent_step: None,
            depth: 0,
            started_at: now,
            updated_at: now,
            expires_at: timeout_seconds.and_then(|s| seconds_after(now, s)),
            ready_at: None,
            error: None,
            cancel_reason: None,
            cancelled_by: None,
            revision: 0,
        }
    }

    /// Create a fresh execution of a definition, honouring the first step's delay
    pub fn from_definition(
        definition: &ChainDefinition,
        namespace: impl Into<String>,
        tenant: impl Into<String>,
        trigger_payload: Value,
    ) -> Self {
        let mut execution = Self::new(
            definition.name(),
            namespace,
            tenant,
            trigger_payload,
            definition.steps().len(),
            definition.timeout_seconds(),
        );

        let delay = definition.steps().first().and_then(|s| s.delay_seconds());
        execution.ready_at = delay.and_then(|s| seconds_after(execution.started_at, s));
        execution
    }

    pub fn with_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_parent(mut self, parent_chain_id: ChainId, parent_step: impl Into<String>, depth: usize) -> Self {
        self.parent_chain_id = Some(parent_chain_id);
        self.parent_step = Some(parent_step.into());
        self.depth = depth;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>, timeout_seconds: Option<u64>) -> Self {
        self.started_at = started_at;
        self.updated_at = started_at;
        self.expires_at = timeout_seconds.and_then(|s| seconds_after(started_at, s));
        self
    }

    // Getters

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn trigger_payload(&self) -> &Value {
        &self.trigger_payload
    }

    pub fn status(&self) -> ChainStatus {
        self.status
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn execution_path(&self) -> &[String] {
        &self.execution_path
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn parent_chain_id(&self) -> Option<&ChainId> {
        self.parent_chain_id.as_ref()
    }

    pub fn parent_step(&self) -> Option<&str> {
        self.parent_step.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.ready_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn cancelled_by(&self) -> Option<&str> {
        self.cancelled_by.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Child this execution is currently waiting on
    pub fn active_child(&self) -> Option<&ChainId> {
        if self.status != ChainStatus::WaitingSubChain {
            return None;
        }
        self.steps
            .last()
            .filter(|record| record.status == StepStatus::Running)
            .and_then(|record| record.child_chain_id.as_ref())
    }

    /// Response body of the most recent successful step
    pub fn last_response_body(&self) -> Option<&Value> {
        self.steps
            .iter()
            .rev()
            .find(|record| record.is_success())
            .and_then(|record| record.response_body.as_ref())
    }

    // Mutators

    /// Append a visited step's record
    pub fn record_step(&mut self, record: StepRecord) {
        self.execution_path.push(record.name.clone());
        self.steps.push(record);
        self.touch();
    }

    pub fn last_step_mut(&mut self) -> Option<&mut StepRecord> {
        self.steps.last_mut()
    }

    /// Move to the step at `index`, holding it until `ready_at` if given
    pub fn set_current_step(&mut self, index: usize, ready_at: Option<DateTime<Utc>>) {
        self.current_step = index;
        self.ready_at = ready_at;
        self.touch();
    }

    pub fn mark_waiting(&mut self) -> Result<(), ChainError> {
        self.transition(ChainStatus::WaitingSubChain)
    }

    pub fn mark_resumed(&mut self) -> Result<(), ChainError> {
        self.transition(ChainStatus::Running)
    }

    pub fn mark_completed(&mut self) -> Result<(), ChainError> {
        self.transition(ChainStatus::Completed)?;
        self.ready_at = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), ChainError> {
        self.transition(ChainStatus::Failed)?;
        self.error = Some(error.into());
        self.ready_at = None;
        Ok(())
    }

    pub fn mark_cancelled(
        &mut self,
        reason: Option<String>,
        cancelled_by: Option<String>,
    ) -> Result<(), ChainError> {
        self.transition(ChainStatus::Cancelled)?;
        self.cancel_reason = reason;
        self.cancelled_by = cancelled_by;
        self.ready_at = None;
        self.close_open_record(StepStatus::Cancelled, "execution cancelled");
        Ok(())
    }

    pub fn mark_timed_out(&mut self) -> Result<(), ChainError> {
        self.transition(ChainStatus::TimedOut)?;
        self.error = Some("execution timed out".to_string());
        self.ready_at = None;
        self.close_open_record(StepStatus::Failed, "execution timed out");
        Ok(())
    }

    /// Set by the execution store after a successful conditional write
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn close_open_record(&mut self, status: StepStatus, message: &str) {
        if let Some(record) = self
            .steps
            .last_mut()
            .filter(|record| record.status == StepStatus::Running)
        {
            record.finish_with(status, Some(message.to_string()));
        }
    }

    fn transition(&mut self, target: ChainStatus) -> Result<(), ChainError> {
        if !self.status.can_transition_to(target) {
            return Err(ChainError::conflict(format!(
                "Execution {} cannot move from {} to {}",
                self.chain_id, self.status, target
            )));
        }
        self.status = target;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Filter for listing executions; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub namespace: Option<String>,
    pub tenant: Option<String>,
    pub statuses: Vec<ChainStatus>,
}

impl ExecutionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every running or waiting execution
    pub fn active() -> Self {
        Self::new().with_statuses(vec![ChainStatus::Running, ChainStatus::WaitingSubChain])
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<ChainStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn matches(&self, execution: &ChainExecution) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| ns == execution.namespace())
            && self
                .tenant
                .as_deref()
                .is_none_or(|tenant| tenant == execution.tenant())
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status()))
    }
}
