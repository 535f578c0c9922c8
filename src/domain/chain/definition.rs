//! Chain definitions: immutable, named workflow templates

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::branch::BranchCondition;
use super::error::ChainError;
use super::template::validate_template;

/// Upper bound for `timeout_seconds` and `delay_seconds` (one year)
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

/// What an unrecovered step failure does to the whole chain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainFailurePolicy {
    /// Fail the execution and push the failing step to the dead-letter sink
    #[default]
    Abort,

    /// Fail the execution without a dead-letter entry
    AbortNoDlq,
}

/// Per-step override of the failure behaviour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepFailurePolicy {
    Abort,
    Skip,
    Dlq,
}

/// When a parallel fan-out counts as done
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelJoinPolicy {
    #[default]
    All,
    Any,
}

/// How a parallel group reacts to a failing sub-step under `join = all`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailurePolicy {
    #[default]
    FailFast,
    BestEffort,
}

/// Provider action fired when an execution is cancelled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationTarget {
    pub provider: String,
    pub action_type: String,
}

impl NotificationTarget {
    pub fn new(provider: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            action_type: action_type.into(),
        }
    }
}

/// Step variants, mutually exclusive per step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainStepKind {
    /// Dispatch a single action to a provider
    Provider(ProviderStep),

    /// Run another chain as a linked child execution
    SubChain(SubChainStep),

    /// Fan out provider actions concurrently
    Parallel(ParallelStep),
}

impl ChainStepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::SubChain(_) => "sub_chain",
            Self::Parallel(_) => "parallel",
        }
    }
}

/// Provider step configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStep {
    pub provider: String,

    pub action_type: String,

    /// JSON template rendered against the execution context
    #[serde(default)]
    pub payload_template: Value,

    /// Ordered conditional successors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchCondition>,

    /// Successor when no branch matches; `""` ends the chain, absent means list order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next: Option<String>,
}

impl ProviderStep {
    pub fn new(provider: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            action_type: action_type.into(),
            payload_template: Value::Null,
            branches: Vec::new(),
            default_next: None,
        }
    }

    pub fn with_payload_template(mut self, template: Value) -> Self {
        self.payload_template = template;
        self
    }

    pub fn with_branch(mut self, branch: BranchCondition) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_default_next(mut self, step: impl Into<String>) -> Self {
        self.default_next = Some(step.into());
        self
    }
}

/// Sub-chain step configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubChainStep {
    /// Name of the referenced chain definition
    pub sub_chain: String,
}

/// A provider-shaped action inside a parallel group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelSubStep {
    pub name: String,

    pub provider: String,

    pub action_type: String,

    #[serde(default)]
    pub payload_template: Value,
}

impl ParallelSubStep {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            action_type: action_type.into(),
            payload_template: Value::Null,
        }
    }

    pub fn with_payload_template(mut self, template: Value) -> Self {
        self.payload_template = template;
        self
    }
}

/// Parallel step configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelStep {
    pub sub_steps: Vec<ParallelSubStep>,

    #[serde(default)]
    pub join: ParallelJoinPolicy,

    /// Serialized as `failure_mode`; `on_failure` belongs to the step envelope
    #[serde(default, rename = "failure_mode")]
    pub on_failure: ParallelFailurePolicy,

    /// Bound on the whole fan-out phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl ParallelStep {
    pub fn new(sub_steps: Vec<ParallelSubStep>) -> Self {
        Self {
            sub_steps,
            join: ParallelJoinPolicy::default(),
            on_failure: ParallelFailurePolicy::default(),
            timeout_seconds: None,
            max_concurrency: None,
        }
    }

    pub fn with_join(mut self, join: ParallelJoinPolicy) -> Self {
        self.join = join;
        self
    }

    pub fn with_on_failure(mut self, on_failure: ParallelFailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }
}

/// A named step in a chain definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainStep {
    name: String,

    #[serde(flatten)]
    kind: ChainStepKind,

    /// Falls back to aborting the chain when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_failure: Option<StepFailurePolicy>,

    /// Hold applied before the step is dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_seconds: Option<u64>,
}

impl ChainStep {
    pub fn new(name: impl Into<String>, kind: ChainStepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            on_failure: None,
            delay_seconds: None,
        }
    }

    pub fn provider(name: impl Into<String>, step: ProviderStep) -> Self {
        Self::new(name, ChainStepKind::Provider(step))
    }

    pub fn sub_chain(name: impl Into<String>, sub_chain: impl Into<String>) -> Self {
        Self::new(
            name,
            ChainStepKind::SubChain(SubChainStep {
                sub_chain: sub_chain.into(),
            }),
        )
    }

    pub fn parallel(name: impl Into<String>, step: ParallelStep) -> Self {
        Self::new(name, ChainStepKind::Parallel(step))
    }

    pub fn with_on_failure(mut self, policy: StepFailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    pub fn with_delay_seconds(mut self, seconds: u64) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ChainStepKind {
        &self.kind
    }

    pub fn on_failure(&self) -> Option<StepFailurePolicy> {
        self.on_failure
    }

    /// The policy actually applied when this step fails
    pub fn effective_on_failure(&self) -> StepFailurePolicy {
        self.on_failure.unwrap_or(StepFailurePolicy::Abort)
    }

    pub fn delay_seconds(&self) -> Option<u64> {
        self.delay_seconds.filter(|s| *s > 0)
    }
}

/// A named, versioned, immutable chain template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainDefinition {
    name: String,

    #[serde(default = "default_version")]
    version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    steps: Vec<ChainStep>,

    #[serde(default)]
    on_failure: ChainFailurePolicy,

    /// Whole-execution deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_cancel: Option<NotificationTarget>,
}

fn default_version() -> u32 {
    1
}

impl ChainDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            steps: Vec::new(),
            on_failure: ChainFailurePolicy::default(),
            timeout_seconds: None,
            on_cancel: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_on_failure(mut self, policy: ChainFailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_on_cancel(mut self, target: NotificationTarget) -> Self {
        self.on_cancel = Some(target);
        self
    }

    // Getters

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn on_failure(&self) -> ChainFailurePolicy {
        self.on_failure
    }

    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout_seconds
    }

    pub fn on_cancel(&self) -> Option<&NotificationTarget> {
        self.on_cancel.as_ref()
    }

    pub fn get_step(&self, name: &str) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Names of every chain referenced by a sub-chain step
    pub fn sub_chain_references(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match &step.kind {
            ChainStepKind::SubChain(sub) => Some(sub.sub_chain.as_str()),
            _ => None,
        })
    }

    /// Check everything that can be resolved inside this definition alone
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.name.trim().is_empty() {
            return Err(ChainError::validation("Chain name cannot be empty"));
        }

        if self.steps.is_empty() {
            return Err(ChainError::validation(format!(
                "Chain '{}' must have at least one step",
                self.name
            )));
        }

        if let Some(seconds) = self.timeout_seconds {
            if seconds > MAX_DURATION_SECONDS {
                return Err(ChainError::validation(format!(
                    "Chain '{}' timeout_seconds {} exceeds the maximum of {}",
                    self.name, seconds, MAX_DURATION_SECONDS
                )));
            }
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(ChainError::validation(format!(
                    "Chain '{}' has a step with an empty name",
                    self.name
                )));
            }
            if !names.insert(step.name.as_str()) {
                return Err(ChainError::validation(format!(
                    "Chain '{}' has duplicate step name '{}'",
                    self.name, step.name
                )));
            }
        }

        for step in &self.steps {
            self.validate_step(step, &names)?;
        }

        Ok(())
    }

    fn validate_step(&self, step: &ChainStep, names: &HashSet<&str>) -> Result<(), ChainError> {
        let context = |message: String| {
            ChainError::validation(format!(
                "Chain '{}' step '{}': {}",
                self.name, step.name, message
            ))
        };

        if let Some(seconds) = step.delay_seconds {
            if seconds > MAX_DURATION_SECONDS {
                return Err(context(format!(
                    "delay_seconds {} exceeds the maximum of {}",
                    seconds, MAX_DURATION_SECONDS
                )));
            }
        }

        match &step.kind {
            ChainStepKind::Provider(provider) => {
                for branch in &provider.branches {
                    if !names.contains(branch.target.as_str()) {
                        return Err(context(format!(
                            "branch target '{}' does not exist",
                            branch.target
                        )));
                    }
                }

                if let Some(next) = provider.default_next.as_deref() {
                    if !next.is_empty() && !names.contains(next) {
                        return Err(context(format!("default_next '{}' does not exist", next)));
                    }
                }

                validate_template(&provider.payload_template, names).map_err(context)?;
            }
            ChainStepKind::SubChain(sub) => {
                if sub.sub_chain.trim().is_empty() {
                    return Err(context("sub_chain cannot be empty".to_string()));
                }
            }
            ChainStepKind::Parallel(parallel) => {
                if parallel.sub_steps.is_empty() {
                    return Err(context("parallel step needs at least one sub-step".to_string()));
                }
                if parallel.max_concurrency == Some(0) {
                    return Err(context("max_concurrency must be greater than zero".to_string()));
                }
                match parallel.timeout_seconds {
                    Some(0) => {
                        return Err(context("timeout_seconds must be greater than zero".to_string()));
                    }
                    Some(seconds) if seconds > MAX_DURATION_SECONDS => {
                        return Err(context(format!(
                            "timeout_seconds {} exceeds the maximum of {}",
                            seconds, MAX_DURATION_SECONDS
                        )));
                    }
                    _ => {}
                }

                let mut sub_names = HashSet::new();
                for sub in &parallel.sub_steps {
                    if !sub_names.insert(sub.name.as_str()) {
                        return Err(context(format!("duplicate sub-step name '{}'", sub.name)));
                    }
                    validate_template(&sub.payload_template, names).map_err(context)?;
                }
            }
        }

        Ok(())
    }
}

/// Validate a full set of definitions: each definition on its own, every
/// sub-chain reference, reference cycles and nesting depth
pub fn validate_definitions(
    definitions: &[ChainDefinition],
    max_depth: usize,
) -> Result<(), ChainError> {
    let mut by_name: HashMap<&str, &ChainDefinition> = HashMap::new();

    for definition in definitions {
        definition.validate()?;
        if by_name.insert(definition.name(), definition).is_some() {
            return Err(ChainError::validation(format!(
                "Duplicate chain definition '{}'",
                definition.name()
            )));
        }
    }

    for definition in definitions {
        for reference in definition.sub_chain_references() {
            if !by_name.contains_key(reference) {
                return Err(ChainError::validation(format!(
                    "Chain '{}' references unknown sub-chain '{}'",
                    definition.name(),
                    reference
                )));
            }
        }
    }

    let mut depths: HashMap<&str, usize> = HashMap::new();
    for definition in definitions {
        let mut stack = Vec::new();
        let depth = nesting_depth(definition.name(), &by_name, &mut stack, &mut depths)?;
        if depth > max_depth {
            return Err(ChainError::validation(format!(
                "Chain '{}' nests sub-chains {} levels deep (maximum {})",
                definition.name(),
                depth,
                max_depth
            )));
        }
    }

    Ok(())
}

fn nesting_depth<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &'a ChainDefinition>,
    stack: &mut Vec<&'a str>,
    depths: &mut HashMap<&'a str, usize>,
) -> Result<usize, ChainError> {
    if let Some(depth) = depths.get(name) {
        return Ok(*depth);
    }

    if stack.contains(&name) {
        let mut cycle: Vec<&str> = stack.clone();
        cycle.push(name);
        return Err(ChainError::validation(format!(
            "Sub-chain cycle detected: {}",
            cycle.join(" -> ")
        )));
    }

    let Some(definition) = by_name.get(name).copied() else {
        return Ok(0);
    };

    stack.push(name);
    let mut depth = 0;
    for reference in definition.sub_chain_references() {
        depth = depth.max(1 + nesting_depth(reference, by_name, stack, depths)?);
    }
    stack.pop();

    depths.insert(name, depth);
    Ok(depth)
}
