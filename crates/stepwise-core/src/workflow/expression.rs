//! JEXL expression evaluator for script-form conditions.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms. The
//! execution context is always passed as a context object, never interpolated
//! into the expression string.

use serde_json::{Value, json};
use stepwise_types::context::ExecutionContext;

use super::capability::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("unsupported expression language '{0}'")]
    UnsupportedLanguage(String),
}

// ---------------------------------------------------------------------------
// JexlEvaluator
// ---------------------------------------------------------------------------

/// Default [`ExpressionEvaluator`]: JEXL with string, boolean and length
/// transforms.
///
/// Accepts language `jexl` or no language at all. Non-boolean results are
/// coerced with JavaScript-like truthiness.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// `jexl_eval::Evaluator` holds boxed transforms that are neither `Send`
    /// nor `Sync`, so one is built per evaluation.
    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    /// Evaluate against a raw JSON context object and return the raw result.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        Self::evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate against a raw JSON context object, coercing to boolean.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(
        &self,
        script: &str,
        language: Option<&str>,
        context: &ExecutionContext,
    ) -> Result<bool, ExpressionError> {
        match language.map(str::trim) {
            None | Some("") => {}
            Some(lang) if lang.eq_ignore_ascii_case("jexl") => {}
            Some(other) => return Err(ExpressionError::UnsupportedLanguage(other.to_string())),
        }
        self.evaluate_bool(script, &context.to_expression_context())
    }
}

/// JavaScript-like truthiness.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new()
            .with_variable("amount", json!(1500))
            .with_variable("region", json!("EU"))
            .with_variable("tags", json!(["urgent", "finance"]))
            .with_trigger_payload(json!({ "source": "github" }));
        ctx.set_step_output("fetch", json!({ "status": 200, "items": [1, 2, 3] }))
            .unwrap();
        ctx.workflow_name = "orders".to_string();
        ctx
    }

    fn eval(expr: &str) -> bool {
        JexlEvaluator::new().evaluate(expr, None, &ctx()).unwrap()
    }

    #[test]
    fn test_top_level_variables() {
        assert!(eval("amount > 1000"));
        assert!(!eval("amount < 1000"));
        assert!(eval("region == 'EU' && amount >= 1500"));
    }

    #[test]
    fn test_namespaced_roots() {
        assert!(eval("variables.amount == 1500"));
        assert!(eval("steps.fetch.output.status == 200"));
        assert!(eval("trigger.source == 'github'"));
        assert!(eval("workflow.name == 'orders'"));
    }

    #[test]
    fn test_array_indexing() {
        assert!(eval("tags[0] == 'urgent'"));
    }

    #[test]
    fn test_transforms() {
        assert!(eval("region|lower == 'eu'"));
        assert!(eval("trigger.source|upper == 'GITHUB'"));
        assert!(eval("steps.fetch.output.items|length == 3"));
        assert!(eval("trigger.source|startsWith('git')"));
        assert!(eval("trigger.source|contains('hub')"));
        assert!(eval("tags|contains('finance')"));
    }

    #[test]
    fn test_truthiness_coercion() {
        assert!(eval("region"));
        assert!(!eval("trigger.missing"));
        assert!(!eval("0"));
        assert!(eval("'x'"));
    }

    #[test]
    fn test_language_gate() {
        let e = JexlEvaluator::new();
        assert!(e.evaluate("amount > 1", Some("jexl"), &ctx()).unwrap());
        assert!(e.evaluate("amount > 1", Some("JEXL"), &ctx()).unwrap());
        let err = e.evaluate("amount > 1", Some("python"), &ctx()).unwrap_err();
        assert!(matches!(err, ExpressionError::UnsupportedLanguage(l) if l == "python"));
    }

    #[test]
    fn test_invalid_context_not_object() {
        let err = JexlEvaluator::new()
            .evaluate_bool("true", &json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn test_syntax_error_is_eval_failed() {
        let err = JexlEvaluator::new()
            .evaluate("amount >", None, &ctx())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed(_)));
    }
}
