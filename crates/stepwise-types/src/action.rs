//! Side-effecting actions attached to steps and transitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::WorkflowCondition;
use crate::definition::RetryPolicy;

/// A single side effect.
///
/// `set_variable` is handled by the engine itself and expects the parameters
/// `variable` plus either `value` (literal, templates resolved) or `from`
/// (context path). Every other type is delegated to a registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Handler tag override (required for `custom`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Action is skipped (not failed) when this evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<WorkflowCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// A failed required action fails its owning step.
    #[serde(default)]
    pub required: bool,
}

impl WorkflowAction {
    /// `set_variable` action assigning a literal.
    pub fn set_variable(id: impl Into<String>, variable: impl Into<String>, value: Value) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("variable".to_string(), Value::String(variable.into()));
        parameters.insert("value".to_string(), value);
        Self {
            id: id.into(),
            name: None,
            action_type: ActionType::SetVariable,
            handler: None,
            parameters,
            condition: None,
            delay_ms: None,
            retry: None,
            required: false,
        }
    }

    /// Handler-backed action of the given type.
    pub fn new(id: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            id: id.into(),
            name: None,
            action_type,
            handler: None,
            parameters: HashMap::new(),
            condition: None,
            delay_ms: None,
            retry: None,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SetVariable,
    Notify,
    Webhook,
    UpdateData,
    Custom,
}

impl ActionType {
    /// Default handler tag for handler-backed action types.
    pub fn default_handler(&self) -> Option<&'static str> {
        match self {
            ActionType::SetVariable | ActionType::Custom => None,
            ActionType::Notify => Some("notify"),
            ActionType::Webhook => Some("webhook"),
            ActionType::UpdateData => Some("update_data"),
        }
    }
}
