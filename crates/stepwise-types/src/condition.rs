//! Condition trees used by transitions, actions, decisions and loops.
//!
//! A condition is either a composite (`and`, `or`, `not` over
//! `sub_conditions`), a leaf comparison of a context variable against a
//! literal or another variable, or an opaque expression handed to the
//! pluggable expression evaluator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recursive boolean condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCondition {
    #[serde(default)]
    pub operator: ConditionOperator,
    /// Left-hand variable path for leaf comparisons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Literal right-hand side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Right-hand side taken from another variable instead of a literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_variable: Option<String>,
    /// Script body for `expression` conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Script language (defaults to the evaluator's default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_conditions: Vec<WorkflowCondition>,
}

impl WorkflowCondition {
    fn empty(operator: ConditionOperator) -> Self {
        Self {
            operator,
            variable: None,
            value: None,
            value_variable: None,
            expression: None,
            language: None,
            sub_conditions: Vec::new(),
        }
    }

    /// Compare a variable against a literal.
    pub fn compare(variable: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            variable: Some(variable.into()),
            value: Some(value),
            ..Self::empty(operator)
        }
    }

    /// Compare a variable against another variable.
    pub fn compare_variables(
        variable: impl Into<String>,
        operator: ConditionOperator,
        other: impl Into<String>,
    ) -> Self {
        Self {
            variable: Some(variable.into()),
            value_variable: Some(other.into()),
            ..Self::empty(operator)
        }
    }

    /// Unary check (`is_null`, `is_not_null`, `is_empty`, `is_not_empty`).
    pub fn check(variable: impl Into<String>, operator: ConditionOperator) -> Self {
        Self {
            variable: Some(variable.into()),
            ..Self::empty(operator)
        }
    }

    pub fn and(conditions: Vec<WorkflowCondition>) -> Self {
        Self {
            sub_conditions: conditions,
            ..Self::empty(ConditionOperator::And)
        }
    }

    pub fn or(conditions: Vec<WorkflowCondition>) -> Self {
        Self {
            sub_conditions: conditions,
            ..Self::empty(ConditionOperator::Or)
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: WorkflowCondition) -> Self {
        Self {
            sub_conditions: vec![condition],
            ..Self::empty(ConditionOperator::Not)
        }
    }

    /// Script-form condition.
    pub fn expression(script: impl Into<String>) -> Self {
        Self {
            expression: Some(script.into()),
            ..Self::empty(ConditionOperator::Expression)
        }
    }
}

/// Operators for composite and leaf conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    And,
    Or,
    Not,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
    #[default]
    Expression,
}

impl ConditionOperator {
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            ConditionOperator::And | ConditionOperator::Or | ConditionOperator::Not
        )
    }

    /// Operators that take no right-hand side.
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            ConditionOperator::IsNull
                | ConditionOperator::IsNotNull
                | ConditionOperator::IsEmpty
                | ConditionOperator::IsNotEmpty
        )
    }
}
