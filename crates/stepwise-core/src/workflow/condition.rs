//! Condition tree evaluator.
//!
//! Pure function of a `WorkflowCondition` and the execution context. Composite
//! operators short-circuit; leaf comparisons resolve a context path against a
//! literal or another path; expression leaves go to the pluggable
//! [`ExpressionEvaluator`].

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::condition::{ConditionOperator, WorkflowCondition};
use stepwise_types::context::ExecutionContext;

use super::capability::ExpressionEvaluator;
use super::expression::ExpressionError;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("malformed condition: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct ConditionEvaluator {
    expressions: Arc<dyn ExpressionEvaluator>,
}

impl ConditionEvaluator {
    pub fn new(expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { expressions }
    }

    /// Evaluate an optional condition; absent conditions hold.
    pub fn holds(
        &self,
        condition: Option<&WorkflowCondition>,
        ctx: &ExecutionContext,
    ) -> Result<bool, ConditionError> {
        match condition {
            Some(c) => self.evaluate(c, ctx),
            None => Ok(true),
        }
    }

    pub fn evaluate(&self, condition: &WorkflowCondition, ctx: &ExecutionContext) -> Result<bool, ConditionError> {
        use ConditionOperator as Op;

        match condition.operator {
            Op::And => {
                for sub in &condition.sub_conditions {
                    if !self.evaluate(sub, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Op::Or => {
                for sub in &condition.sub_conditions {
                    if self.evaluate(sub, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Op::Not => match condition.sub_conditions.as_slice() {
                [only] => Ok(!self.evaluate(only, ctx)?),
                other => Err(ConditionError::Malformed(format!(
                    "'not' takes exactly one sub-condition, got {}",
                    other.len()
                ))),
            },
            Op::Expression => {
                let script = condition
                    .expression
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| ConditionError::Malformed("expression condition has no expression".into()))?;
                Ok(self
                    .expressions
                    .evaluate(script, condition.language.as_deref(), ctx)?)
            }
            op => {
                let variable = condition
                    .variable
                    .as_deref()
                    .ok_or_else(|| ConditionError::Malformed(format!("'{op:?}' needs a variable")))?;
                let left = ctx.lookup(variable).unwrap_or(Value::Null);

                if op.is_unary() {
                    return Ok(match op {
                        Op::IsNull => left.is_null(),
                        Op::IsNotNull => !left.is_null(),
                        Op::IsEmpty => is_empty(&left),
                        _ => !is_empty(&left),
                    });
                }

                let right = match (&condition.value_variable, &condition.value) {
                    (Some(path), _) => ctx.lookup(path).unwrap_or(Value::Null),
                    (None, Some(value)) => ctx.resolve_value(value),
                    (None, None) => Value::Null,
                };
                Ok(compare(op, &left, &right))
            }
        }
    }
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Leaf comparison helpers
// ---------------------------------------------------------------------------

fn compare(op: ConditionOperator, left: &Value, right: &Value) -> bool {
    use ConditionOperator as Op;

    match op {
        Op::Equals => loosely_equal(left, right),
        Op::NotEquals => !loosely_equal(left, right),
        Op::GreaterThan => ordering(left, right) == Some(Ordering::Greater),
        Op::GreaterThanOrEqual => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        Op::LessThan => ordering(left, right) == Some(Ordering::Less),
        Op::LessThanOrEqual => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        Op::Contains => contains(left, right),
        Op::NotContains => !contains(left, right),
        Op::StartsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.starts_with(r),
            _ => false,
        },
        Op::EndsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.ends_with(r),
            _ => false,
        },
        Op::In => contains(right, left),
        Op::NotIn => !contains(right, left),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Numbers compare numerically (numeric strings included), everything else
/// by JSON equality.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left.is_number() || right.is_number() {
        if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
            return l == r;
        }
    }
    left == right
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Substring for strings, membership for arrays, key presence for objects.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
