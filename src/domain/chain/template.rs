//! Payload template rendering
//!
//! Any string inside a payload template may contain `{{ expr }}` placeholders:
//! - `{{origin.payload.path}}`, `{{origin.namespace}}`, `{{origin.tenant}}`, `{{origin.chain_name}}`
//! - `{{prev.body.path}}`, `{{prev.status}}`, `{{prev.error}}` - the last recorded step
//! - `{{steps.NAME.body.path}}`, `{{steps.NAME.status}}`, `{{steps.NAME.error}}`
//! - `{{chain_id}}`, `{{step_index}}`
//!
//! A string holding a single placeholder is replaced by the raw JSON value;
//! otherwise values are substituted inline. Missing paths render as `null`.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::execution::{ChainExecution, StepRecord};

static PLACEHOLDER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap());

static SINGLE_PLACEHOLDER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{\{\s*([^{}]*?)\s*\}\}$").unwrap());

/// Everything a template may reference while rendering one step
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub execution: &'a ChainExecution,
    pub step_index: usize,
}

impl<'a> TemplateContext<'a> {
    pub fn new(execution: &'a ChainExecution, step_index: usize) -> Self {
        Self {
            execution,
            step_index,
        }
    }

    /// Render a JSON template, recursing through arrays and objects
    pub fn render(&self, template: &Value) -> Value {
        match template {
            Value::String(s) => self.render_string(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_string(&self, template: &str) -> Value {
        if let Some(caps) = SINGLE_PLACEHOLDER_PATTERN.captures(template) {
            return self.resolve_expression(&caps[1]);
        }

        let rendered = PLACEHOLDER_PATTERN.replace_all(template, |caps: &regex::Captures| {
            value_to_string(&self.resolve_expression(&caps[1]))
        });

        Value::String(rendered.into_owned())
    }

    /// Resolve a single dotted expression
    pub fn resolve_expression(&self, expression: &str) -> Value {
        let mut parts = expression.splitn(2, '.');
        let root = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        match root {
            "chain_id" => Value::String(self.execution.chain_id().to_string()),
            "step_index" => Value::from(self.step_index),
            "origin" => self.resolve_origin(rest),
            "prev" => self
                .execution
                .steps()
                .last()
                .map_or(Value::Null, |record| resolve_record(record, rest)),
            "steps" => {
                let (name, field) = rest.split_once('.').unwrap_or((rest, ""));
                self.execution
                    .steps()
                    .iter()
                    .rev()
                    .find(|record| record.name == name)
                    .map_or(Value::Null, |record| resolve_record(record, field))
            }
            _ => Value::Null,
        }
    }

    fn resolve_origin(&self, path: &str) -> Value {
        let (field, rest) = path.split_once('.').unwrap_or((path, ""));

        match field {
            "payload" => lookup(self.execution.trigger_payload(), rest),
            "namespace" => Value::String(self.execution.namespace().to_string()),
            "tenant" => Value::String(self.execution.tenant().to_string()),
            "chain_name" => Value::String(self.execution.chain_name().to_string()),
            _ => Value::Null,
        }
    }
}

fn resolve_record(record: &StepRecord, path: &str) -> Value {
    let (field, rest) = path.split_once('.').unwrap_or((path, ""));

    match field {
        "body" => record
            .response_body
            .as_ref()
            .map_or(Value::Null, |body| lookup(body, rest)),
        "status" => Value::String(record.status.to_string()),
        "error" => record.error.clone().map_or(Value::Null, Value::String),
        _ => Value::Null,
    }
}

fn lookup(value: &Value, path: &str) -> Value {
    get_nested_field(value, path).cloned().unwrap_or(Value::Null)
}

/// Get a nested field from a JSON value using dot notation; an empty path
/// returns the value itself
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => {
                current = obj.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Convert a JSON value to its inline string form
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Check every placeholder in a template at definition-load time
pub fn validate_template(template: &Value, step_names: &HashSet<&str>) -> Result<(), String> {
    match template {
        Value::String(s) => validate_string(s, step_names),
        Value::Array(items) => items
            .iter()
            .try_for_each(|v| validate_template(v, step_names)),
        Value::Object(map) => map
            .values()
            .try_for_each(|v| validate_template(v, step_names)),
        _ => Ok(()),
    }
}

fn validate_string(template: &str, step_names: &HashSet<&str>) -> Result<(), String> {
    let stripped = PLACEHOLDER_PATTERN.replace_all(template, "");
    if stripped.contains("{{") || stripped.contains("}}") {
        return Err(format!("malformed template '{}'", template));
    }

    for caps in PLACEHOLDER_PATTERN.captures_iter(template) {
        validate_expression(&caps[1], step_names)?;
    }

    Ok(())
}

fn validate_expression(expression: &str, step_names: &HashSet<&str>) -> Result<(), String> {
    let parts: Vec<&str> = expression.split('.').collect();
    let invalid = || format!("invalid template expression '{{{{{}}}}}'", expression);

    match parts.as_slice() {
        ["chain_id"] | ["step_index"] => Ok(()),
        ["origin", "payload", ..] => Ok(()),
        ["origin", "namespace" | "tenant" | "chain_name"] => Ok(()),
        ["prev", "body", ..] => Ok(()),
        ["prev", "status" | "error"] => Ok(()),
        ["steps", name, field, ..] => {
            if !step_names.contains(name) {
                return Err(format!(
                    "template references unknown step '{}' in '{{{{{}}}}}'",
                    name, expression
                ));
            }
            match (*field, parts.len()) {
                ("body", _) | ("status" | "error", 3) => Ok(()),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chain::execution::{ChainExecution, StepKind, StepRecord, StepStatus};
    use serde_json::json;

    fn execution() -> ChainExecution {
        let mut execution = ChainExecution::new(
            "incident",
            "prod",
            "acme",
            json!({"alert": {"title": "disk full", "tags": ["db", "eu"]}, "count": 3}),
            3,
            None,
        );

        let mut triage = StepRecord::new("triage", 0, StepKind::Provider);
        triage.status = StepStatus::Completed;
        triage.response_body = Some(json!({"severity": "high", "ticket": {"id": 42}}));
        execution.record_step(triage);

        let mut notify = StepRecord::new("notify", 1, StepKind::Provider);
        notify.status = StepStatus::Failed;
        notify.error = Some("HTTP status 500".to_string());
        execution.record_step(notify);

        execution
    }

    fn names() -> HashSet<&'static str> {
        ["triage", "notify", "page"].into_iter().collect()
    }

    #[test]
    fn test_single_placeholder_preserves_type() {
        let execution = execution();
        let ctx = TemplateContext::new(&execution, 2);

        assert_eq!(ctx.render(&json!("{{ origin.payload.count }}")), json!(3));
        assert_eq!(
            ctx.render(&json!("{{steps.triage.body.ticket}}")),
            json!({"id": 42})
        );
        assert_eq!(ctx.render(&json!("{{step_index}}")), json!(2));
    }

    #[test]
    fn test_inline_substitution() {
        let execution = execution();
        let ctx = TemplateContext::new(&execution, 2);

        let rendered = ctx.render(&json!({
            "text": "[{{origin.namespace}}/{{origin.tenant}}] {{origin.payload.alert.title}} is {{steps.triage.body.severity}}",
            "tags": ["{{origin.payload.alert.tags.1}}"],
            "limit": 10
        }));

        assert_eq!(
            rendered,
            json!({
                "text": "[prod/acme] disk full is high",
                "tags": ["eu"],
                "limit": 10
            })
        );
    }

    #[test]
    fn test_prev_refers_to_last_record() {
        let execution = execution();
        let ctx = TemplateContext::new(&execution, 2);

        assert_eq!(ctx.render(&json!("{{prev.status}}")), json!("failed"));
        assert_eq!(ctx.render(&json!("{{prev.error}}")), json!("HTTP status 500"));
        assert_eq!(ctx.render(&json!("{{prev.body.anything}}")), Value::Null);
    }

    #[test]
    fn test_missing_paths_render_null() {
        let execution = execution();
        let ctx = TemplateContext::new(&execution, 0);

        assert_eq!(ctx.render(&json!("{{origin.payload.nope}}")), Value::Null);
        assert_eq!(ctx.render(&json!("{{steps.page.body}}")), Value::Null);
        assert_eq!(ctx.render(&json!("id={{steps.page.body.id}}")), json!("id="));
    }

    #[test]
    fn test_chain_id_placeholder() {
        let execution = execution();
        let ctx = TemplateContext::new(&execution, 0);

        assert_eq!(
            ctx.render(&json!("{{chain_id}}")),
            json!(execution.chain_id().to_string())
        );
    }

    #[test]
    fn test_validate_accepts_known_expressions() {
        let template = json!({
            "a": "{{origin.payload.alert}}",
            "b": "{{ prev.body.x }} and {{steps.triage.status}}",
            "c": ["{{chain_id}}", "{{step_index}}", 5]
        });
        assert!(validate_template(&template, &names()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_step() {
        let err = validate_template(&json!("{{steps.ghost.body}}"), &names()).unwrap_err();
        assert!(err.contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_validate_rejects_malformed_placeholders() {
        assert!(validate_template(&json!("{{origin.payload"), &names()).is_err());
        assert!(validate_template(&json!("{{unknown.root}}"), &names()).is_err());
        assert!(validate_template(&json!("{{origin.region}}"), &names()).is_err());
        assert!(validate_template(&json!("{{steps.triage}}"), &names()).is_err());
    }

    #[test]
    fn test_nested_field_access() {
        let value = json!({"a": {"b": [{"c": 1}]}});
        assert_eq!(get_nested_field(&value, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(get_nested_field(&value, ""), Some(&value));
        assert_eq!(get_nested_field(&value, "a.x"), None);
    }
}
