//! Action executor: runs one side-effecting action of a step or transition.
//!
//! `set_variable` mutates the execution context directly. Every other action
//! type is dispatched by handler tag through the [`HandlerRegistry`]. A false
//! condition marks the action completed-and-skipped. Failures are retried per
//! the action's retry policy; an exhausted failure only matters to the owning
//! step when the action is `required`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use stepwise_types::action::{ActionType, WorkflowAction};
use stepwise_types::context::ExecutionContext;
use stepwise_types::execution::{ActionExecutionStatus, ActionOrigin, WorkflowActionExecution};
use tracing::{debug, warn};
use uuid::Uuid;

use super::capability::{Capabilities, HandlerError, HandlerRegistry, HandlerRequest};
use super::clock::Clock;
use super::condition::{ConditionError, ConditionEvaluator};
use super::retry::RetryHandler;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("invalid action parameters: {0}")]
    InvalidParameters(String),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("action condition failed: {0}")]
    Condition(#[from] ConditionError),
}

impl ActionError {
    /// Code matched against retry_on / no_retry_on, if this error is retryable.
    fn retry_code(&self) -> Option<Option<&str>> {
        match self {
            ActionError::Handler(e) => Some(e.code.as_deref()),
            ActionError::Timeout(_) => Some(Some("timeout")),
            _ => None,
        }
    }
}

/// Where an action runs: used for handler requests and log fields.
#[derive(Debug, Clone, Copy)]
pub struct ActionScope<'a> {
    pub execution_id: Uuid,
    pub step_id: &'a str,
}

#[derive(Clone)]
pub struct ActionExecutor {
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    conditions: ConditionEvaluator,
    handler_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(capabilities: &Capabilities, handler_timeout: Duration) -> Self {
        Self {
            handlers: capabilities.handlers.clone(),
            clock: capabilities.clock.clone(),
            conditions: ConditionEvaluator::new(capabilities.expressions.clone()),
            handler_timeout,
        }
    }

    /// Run a list of actions in declared order.
    ///
    /// Stops at the first failed required action and returns its id alongside
    /// the records produced so far.
    pub async fn execute_all(
        &self,
        actions: &[WorkflowAction],
        origin: &ActionOrigin,
        ctx: &mut ExecutionContext,
        scope: ActionScope<'_>,
    ) -> (Vec<WorkflowActionExecution>, Option<(String, String)>) {
        let mut records = Vec::with_capacity(actions.len());
        for action in actions {
            let record = self.execute(action, origin.clone(), ctx, scope).await;
            let failed = record.status == ActionExecutionStatus::Failed;
            let message = record.error_message.clone().unwrap_or_default();
            records.push(record);
            if failed && action.required {
                return (records, Some((action.id.clone(), message)));
            }
        }
        (records, None)
    }

    /// Run one action and return its audit record.
    pub async fn execute(
        &self,
        action: &WorkflowAction,
        origin: ActionOrigin,
        ctx: &mut ExecutionContext,
        scope: ActionScope<'_>,
    ) -> WorkflowActionExecution {
        let mut record = WorkflowActionExecution {
            id: Uuid::now_v7(),
            action_id: action.id.clone(),
            action_type: action.action_type,
            origin,
            status: ActionExecutionStatus::Running,
            result: None,
            error_message: None,
            attempts: 0,
            skipped: false,
            started_at: self.clock.now(),
            completed_at: None,
        };

        match self.conditions.holds(action.condition.as_ref(), ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    execution_id = %scope.execution_id,
                    step_id = scope.step_id,
                    action_id = %action.id,
                    "action condition false, skipping"
                );
                record.status = ActionExecutionStatus::Completed;
                record.skipped = true;
                record.completed_at = Some(self.clock.now());
                return record;
            }
            Err(e) => {
                return self.finish_failed(record, &ActionError::from(e));
            }
        }

        if let Some(delay) = action.delay_ms.filter(|d| *d > 0) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let policy = action.retry.clone().unwrap_or_else(RetryHandler::single_attempt);
        loop {
            record.attempts += 1;
            let attempt = record.attempts;
            match self.run_once(action, ctx, scope, attempt).await {
                Ok(result) => {
                    record.status = ActionExecutionStatus::Completed;
                    record.result = Some(result);
                    record.error_message = None;
                    record.completed_at = Some(self.clock.now());
                    return record;
                }
                Err(err) => {
                    let retry = err
                        .retry_code()
                        .is_some_and(|code| RetryHandler::should_retry(&policy, attempt, code));
                    if !retry {
                        return self.finish_failed(record, &err);
                    }
                    let delay = RetryHandler::delay_for(&policy, attempt);
                    warn!(
                        execution_id = %scope.execution_id,
                        step_id = scope.step_id,
                        action_id = %action.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "action failed, retrying"
                    );
                    record.status = ActionExecutionStatus::Retrying;
                    record.error_message = Some(err.to_string());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn run_once(
        &self,
        action: &WorkflowAction,
        ctx: &mut ExecutionContext,
        scope: ActionScope<'_>,
        attempt: u32,
    ) -> Result<Value, ActionError> {
        if action.action_type == ActionType::SetVariable {
            return set_variable(action, ctx);
        }

        let tag = action
            .handler
            .as_deref()
            .or(action.action_type.default_handler())
            .ok_or_else(|| ActionError::InvalidParameters("custom action needs a handler".into()))?;
        let handler = self
            .handlers
            .get(tag)
            .ok_or_else(|| ActionError::HandlerNotFound(tag.to_string()))?;

        let parameters = ctx.resolve_value(&Value::Object(action.parameters.clone().into_iter().collect()));
        let request = HandlerRequest {
            handler: tag.to_string(),
            parameters,
            input: json!(ctx.variables),
            execution_id: scope.execution_id,
            step_id: scope.step_id.to_string(),
            action_id: Some(action.id.clone()),
            attempt,
        };

        match tokio::time::timeout(self.handler_timeout, handler.invoke(&request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ActionError::Timeout(self.handler_timeout)),
        }
    }

    fn finish_failed(&self, mut record: WorkflowActionExecution, err: &ActionError) -> WorkflowActionExecution {
        warn!(action_id = %record.action_id, attempts = record.attempts, error = %err, "action failed");
        record.status = ActionExecutionStatus::Failed;
        record.error_message = Some(err.to_string());
        record.completed_at = Some(self.clock.now());
        record
    }
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

/// `variable` names the target; the value comes from `value` (templates
/// resolved) or is copied from the context path in `from`.
fn set_variable(action: &WorkflowAction, ctx: &mut ExecutionContext) -> Result<Value, ActionError> {
    let name = action
        .parameters
        .get("variable")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ActionError::InvalidParameters("set_variable needs 'variable'".into()))?
        .to_string();

    let value = match (action.parameters.get("value"), action.parameters.get("from")) {
        (Some(v), _) => ctx.resolve_value(v),
        (None, Some(Value::String(path))) => ctx.lookup(path).unwrap_or(Value::Null),
        _ => {
            return Err(ActionError::InvalidParameters(
                "set_variable needs 'value' or 'from'".into(),
            ));
        }
    };

    ctx.set_variable(name.clone(), value.clone());
    Ok(json!({ "variable": name, "value": value }))
}
