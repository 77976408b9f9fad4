//! Execution context: the mutable variable bag threaded through a run.
//!
//! Stores process variables, step outputs and the trigger payload, with size
//! limits to prevent unbounded growth. Paths such as `order.total`,
//! `variables.order.items.0`, `steps.fetch.output.status` and
//! `trigger.source` address values inside the context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ContextError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Path roots `lookup` treats as namespaces. A variable named after one of
/// these is only reachable as `variables.<name>`.
pub const RESERVED_ROOTS: [&str; 4] = ["variables", "steps", "trigger", "workflow"];

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Process variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Step outputs keyed by step ID.
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
    /// Payload the execution was started with (webhook body, event, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
    /// Principal that started the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    /// Filled in by the engine on start.
    #[serde(default)]
    pub workflow_name: String,
    /// Filled in by the engine on start.
    #[serde(default)]
    pub execution_id: Uuid,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variable assignment.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_trigger_payload(mut self, payload: Value) -> Self {
        self.trigger_payload = Some(payload);
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn get_step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// Store the output of a completed step.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` are replaced by a marker
    /// object; the returned flag reports whether that happened. Fails when the
    /// whole context would exceed `MAX_CONTEXT_SIZE`, leaving the previous
    /// output in place.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) -> Result<bool, ContextError> {
        let serialized =
            serde_json::to_string(&output).map_err(|e| ContextError::Serialization(e.to_string()))?;

        let (stored, truncated) = if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            let marker = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    MAX_STEP_OUTPUT_SIZE
                )
            });
            (marker, true)
        } else {
            (output, false)
        };

        let previous = self.step_outputs.insert(step_id.to_string(), stored);
        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            match previous {
                Some(prev) => self.step_outputs.insert(step_id.to_string(), prev),
                None => self.step_outputs.remove(step_id),
            };
            return Err(ContextError::TooLarge {
                size: total,
                limit: MAX_CONTEXT_SIZE,
            });
        }
        Ok(truncated)
    }

    /// Resolve a dotted path.
    ///
    /// Roots: `variables.`, `steps.<id>.output`, `trigger`, `workflow.name`,
    /// `workflow.execution_id` (see [`RESERVED_ROOTS`]); anything else is
    /// read as a variable name. Numeric segments index into arrays.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let mut segments = path.split('.');
        let head = segments.next()?;

        match head {
            "variables" => {
                let name = segments.next()?;
                descend(self.variables.get(name)?, segments).cloned()
            }
            "steps" => {
                let step_id = segments.next()?;
                let output = self.step_outputs.get(step_id)?;
                match segments.next() {
                    None | Some("output") => descend(output, segments).cloned(),
                    Some(_) => None,
                }
            }
            "trigger" => descend(self.trigger_payload.as_ref()?, segments).cloned(),
            "workflow" => match segments.next()? {
                "name" => Some(Value::String(self.workflow_name.clone())),
                "execution_id" => Some(Value::String(self.execution_id.to_string())),
                _ => None,
            },
            name => descend(self.variables.get(name)?, segments).cloned(),
        }
    }

    /// Replace `{{ path }}` markers with the string form of the resolved
    /// value. Unresolvable markers are left as-is.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            out.push_str(&rest[..start]);
            let expr = rest[start + 2..end - 2].trim();
            match self.lookup(expr) {
                Some(value) => out.push_str(&value_to_string(&value)),
                None => out.push_str(&rest[start..end]),
            }
            rest = &rest[end..];
        }
        out.push_str(rest);
        out
    }

    /// Resolve templates inside a JSON value, recursively.
    ///
    /// A string consisting of exactly one marker resolves to the referenced
    /// value with its JSON type intact.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                let whole = s
                    .trim()
                    .strip_prefix("{{")
                    .and_then(|r| r.strip_suffix("}}"))
                    .filter(|inner| !inner.contains("{{") && !inner.contains("}}"))
                    .and_then(|inner| self.lookup(inner));
                match whole {
                    Some(resolved) => resolved,
                    None => Value::String(self.resolve_template(s)),
                }
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let size_of = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let outputs: usize = self.step_outputs.values().map(size_of).sum();
        let variables: usize = self.variables.values().map(size_of).sum();
        let trigger = self.trigger_payload.as_ref().map(size_of).unwrap_or(0);
        outputs + variables + trigger
    }

    /// Build a JSON object for expression evaluation.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "variables": { ... },
    ///   "steps": { "<step_id>": { "output": <value> } },
    ///   "trigger": <trigger_payload or {}>,
    ///   "workflow": { "name": "...", "execution_id": "..." }
    /// }
    /// ```
    /// Every variable is also exposed at the top level unless it collides
    /// with one of the four roots.
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (id, output) in &self.step_outputs {
            steps.insert(id.clone(), json!({ "output": output }));
        }

        let mut root = serde_json::Map::new();
        for (name, value) in &self.variables {
            root.insert(name.clone(), value.clone());
        }
        root.insert("variables".to_string(), json!(self.variables));
        root.insert("steps".to_string(), Value::Object(steps));
        root.insert(
            "trigger".to_string(),
            self.trigger_payload.clone().unwrap_or(json!({})),
        );
        root.insert(
            "workflow".to_string(),
            json!({
                "name": self.workflow_name,
                "execution_id": self.execution_id.to_string(),
            }),
        );
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn descend<'a, 'p>(mut current: &'a Value, segments: impl Iterator<Item = &'p str>) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Convert a JSON value to a display string for template resolution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new()
            .with_variable("amount", json!(1500))
            .with_variable("order", json!({ "id": "A-1", "items": [{ "sku": "x" }, { "sku": "y" }] }))
            .with_trigger_payload(json!({ "source": "webhook" }));
        ctx.workflow_name = "orders".to_string();
        ctx
    }

    #[test]
    fn test_lookup_roots() {
        let mut ctx = test_context();
        ctx.set_step_output("fetch", json!({ "status": 200 })).unwrap();

        assert_eq!(ctx.lookup("amount"), Some(json!(1500)));
        assert_eq!(ctx.lookup("variables.amount"), Some(json!(1500)));
        assert_eq!(ctx.lookup("order.items.1.sku"), Some(json!("y")));
        assert_eq!(ctx.lookup("steps.fetch.output.status"), Some(json!(200)));
        assert_eq!(ctx.lookup("steps.fetch"), Some(json!({ "status": 200 })));
        assert_eq!(ctx.lookup("trigger.source"), Some(json!("webhook")));
        assert_eq!(ctx.lookup("workflow.name"), Some(json!("orders")));
        assert_eq!(ctx.lookup("missing"), None);
        assert_eq!(ctx.lookup("order.items.9"), None);
        assert_eq!(ctx.lookup(""), None);
    }

    #[test]
    fn test_resolve_template_mixed() {
        let mut ctx = test_context();
        ctx.set_step_output("fetch", json!("ok")).unwrap();
        let out = ctx.resolve_template(
            "order {{ variables.order.id }} from {{ trigger.source }}: {{ steps.fetch.output }} {{ nope }}",
        );
        assert_eq!(out, "order A-1 from webhook: ok {{ nope }}");
    }

    #[test]
    fn test_resolve_template_unterminated_marker() {
        let ctx = test_context();
        assert_eq!(ctx.resolve_template("total {{ amount"), "total {{ amount");
    }

    #[test]
    fn test_resolve_value_preserves_types() {
        let ctx = test_context();
        let params = json!({
            "amount": "{{ amount }}",
            "label": "amount={{ amount }}",
            "nested": ["{{ order.items.0 }}"]
        });
        let resolved = ctx.resolve_value(&params);
        assert_eq!(resolved["amount"], json!(1500));
        assert_eq!(resolved["label"], json!("amount=1500"));
        assert_eq!(resolved["nested"][0], json!({ "sku": "x" }));
    }

    #[test]
    fn test_step_output_truncated_when_oversized() {
        let mut ctx = ExecutionContext::new();
        let big = "x".repeat(MAX_STEP_OUTPUT_SIZE + 10);
        let truncated = ctx.set_step_output("big", json!(big)).unwrap();
        assert!(truncated);
        assert_eq!(ctx.get_step_output("big").unwrap()["_truncated"], true);
    }

    #[test]
    fn test_context_size_limit_rejects_and_restores() {
        let mut ctx = ExecutionContext::new();
        let chunk = "y".repeat(MAX_STEP_OUTPUT_SIZE - 100);
        for i in 0..10 {
            ctx.set_step_output(&format!("s{i}"), json!(chunk)).unwrap();
        }
        let err = ctx.set_step_output("overflow", json!(chunk)).unwrap_err();
        assert!(matches!(err, ContextError::TooLarge { .. }));
        assert!(ctx.get_step_output("overflow").is_none());
    }

    #[test]
    fn test_expression_context_shape() {
        let mut ctx = test_context();
        ctx.set_step_output("fetch", json!(1)).unwrap();
        let v = ctx.to_expression_context();
        assert_eq!(v["amount"], 1500);
        assert_eq!(v["variables"]["amount"], 1500);
        assert_eq!(v["steps"]["fetch"]["output"], 1);
        assert_eq!(v["trigger"]["source"], "webhook");
        assert_eq!(v["workflow"]["name"], "orders");
    }

    #[test]
    fn test_context_serde_round_trip_keeps_outputs() {
        let mut ctx = test_context();
        ctx.set_step_output("a", json!([1, 2])).unwrap();
        let restored: ExecutionContext =
            serde_json::from_value(serde_json::to_value(&ctx).unwrap()).unwrap();
        assert_eq!(restored.get_step_output("a"), Some(&json!([1, 2])));
        assert_eq!(restored.get_variable("amount"), Some(&json!(1500)));
    }
}
