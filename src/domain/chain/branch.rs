//! Branch resolution for provider steps
//!
//! Conditions are evaluated strictly in declaration order and the first match
//! wins. Fields are resolved against the step outcome:
//! - `success` - the step's success flag
//! - `body` / `body.path` - the response body
//! - any other path - navigated directly inside the response body

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::{ChainDefinition, ChainStepKind};
use super::template::get_nested_field;

/// A conditional edge from a provider step to a named successor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchCondition {
    /// Outcome field to inspect
    pub field: String,

    pub operator: BranchOperator,

    /// Value to compare against (ignored by `exists`)
    #[serde(default)]
    pub value: Value,

    /// Step to jump to when the condition matches
    pub target: String,
}

impl BranchCondition {
    pub fn new(
        field: impl Into<String>,
        operator: BranchOperator,
        target: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Value::Null,
            target: target.into(),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    /// Evaluate this condition against a step outcome
    pub fn matches(&self, success: bool, body: &Value) -> bool {
        let field_value = resolve_field(&self.field, success, body);
        self.operator.evaluate(field_value.as_ref(), &self.value)
    }

    /// Human-readable label used on DAG edges
    pub fn label(&self) -> String {
        match self.operator {
            BranchOperator::Exists => format!("{} exists", self.field),
            _ => format!("{} {} {}", self.field, self.operator, self.value),
        }
    }
}

/// Branch comparison operators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchOperator {
    Eq,
    Neq,
    Contains,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl BranchOperator {
    /// Evaluate the operator; `None` means the field is absent from the outcome
    pub fn evaluate(&self, field_value: Option<&Value>, compare_value: &Value) -> bool {
        match self {
            Self::Exists => field_value.is_some_and(|v| !v.is_null()),
            Self::Eq => field_value.unwrap_or(&Value::Null) == compare_value,
            Self::Neq => field_value.unwrap_or(&Value::Null) != compare_value,
            Self::Contains => field_value.is_some_and(|v| contains(v, compare_value)),
            Self::Gt => compare_ordered(field_value, compare_value, Ordering::is_gt),
            Self::Gte => compare_ordered(field_value, compare_value, Ordering::is_ge),
            Self::Lt => compare_ordered(field_value, compare_value, Ordering::is_lt),
            Self::Lte => compare_ordered(field_value, compare_value, Ordering::is_le),
        }
    }
}

impl std::fmt::Display for BranchOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Contains => "contains",
            Self::Exists => "exists",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        };
        write!(f, "{}", symbol)
    }
}

/// Numbers compare numerically, strings lexicographically; mixed types never match
fn compare_ordered<F>(field: Option<&Value>, value: &Value, predicate: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let ordering = match (field, value) {
        (Some(Value::Number(a)), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Some(Value::String(a)), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    };
    ordering.is_some_and(predicate)
}

/// Non-collection fields never contain anything
fn contains(field: &Value, value: &Value) -> bool {
    match field {
        Value::String(s) => value.as_str().is_some_and(|v| s.contains(v)),
        Value::Array(arr) => arr.contains(value),
        Value::Object(obj) => value.as_str().is_some_and(|key| obj.contains_key(key)),
        _ => false,
    }
}

/// Resolve a branch field against a step outcome
pub fn resolve_field(field: &str, success: bool, body: &Value) -> Option<Value> {
    if field == "success" {
        return Some(Value::Bool(success));
    }

    if field == "body" {
        return Some(body.clone());
    }

    let path = field.strip_prefix("body.").unwrap_or(field);
    get_nested_field(body, path).cloned()
}

/// Where an execution goes after a step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Advance to the step at this index
    Step(usize),

    /// No successor; the execution completes
    Complete,
}

/// Pick the step that follows a successful attempt of the step at `index`
pub fn resolve_next_step(definition: &ChainDefinition, index: usize, body: &Value) -> NextStep {
    let Some(step) = definition.steps().get(index) else {
        return NextStep::Complete;
    };

    let ChainStepKind::Provider(provider) = step.kind() else {
        return sequential_next(definition, index);
    };

    if let Some(branch) = provider
        .branches
        .iter()
        .find(|branch| branch.matches(true, body))
    {
        return definition
            .step_index(&branch.target)
            .map_or(NextStep::Complete, NextStep::Step);
    }

    match provider.default_next.as_deref() {
        Some("") => NextStep::Complete,
        Some(name) => definition
            .step_index(name)
            .map_or(NextStep::Complete, NextStep::Step),
        None => sequential_next(definition, index),
    }
}

/// The next step in list order, used after recovered failures and for
/// sub-chain and parallel steps
pub fn sequential_next(definition: &ChainDefinition, index: usize) -> NextStep {
    if index + 1 < definition.steps().len() {
        NextStep::Step(index + 1)
    } else {
        NextStep::Complete
    }
}
