//! Step executor for all 15 step types.
//!
//! `StepExecutor` prepares step input, dispatches on `StepType`, and records
//! the outcome on the `WorkflowStepExecution` it is handed. Steps that wait
//! (user tasks, catch events, timers) return [`StepOutcome::Waiting`] with the
//! durable wakes to arm; the engine parks the run and later completes the
//! step through [`StepExecutor::complete`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use stepwise_types::context::ExecutionContext;
use stepwise_types::definition::{StepType, TimeoutAction, WorkflowStep};
use stepwise_types::execution::{
    ActionOrigin, ErrorCode, StepExecutionStatus, WaitReason, WakeKind, WorkflowStepExecution,
};
use stepwise_types::error::ContextError;
use tracing::{debug, warn};

use super::action::{ActionExecutor, ActionScope};
use super::capability::{Capabilities, HandlerRequest};
use super::condition::{ConditionError, ConditionEvaluator};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What happened to a step visit.
#[derive(Debug)]
pub enum StepOutcome {
    Completed,
    /// Parked awaiting a signal or timer; `wakes` must be armed durably.
    Waiting {
        reason: WaitReason,
        wakes: Vec<(WakeKind, DateTime<Utc>)>,
    },
    Failed(StepError),
    /// A synchronous step exceeded its timeout policy. The policy action is
    /// applied by the engine.
    TimedOut { message: String },
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("handler failed after {attempts} attempt(s): {message}")]
    HandlerExecutionFailed { message: String, attempts: u32 },

    #[error("assignment unresolved: {0}")]
    AssignmentUnresolved(String),

    #[error("step timed out: {0}")]
    Timeout(String),

    #[error("condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),

    #[error("required action '{action_id}' failed: {message}")]
    RequiredActionFailed { action_id: String, message: String },

    #[error("invalid step configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl StepError {
    /// Stable code recorded in the audit trail.
    pub fn code(&self) -> ErrorCode {
        match self {
            StepError::HandlerNotFound(_) => ErrorCode::HandlerNotFound,
            StepError::HandlerExecutionFailed { .. } => ErrorCode::HandlerExecutionFailed,
            StepError::AssignmentUnresolved(_) => ErrorCode::AssignmentUnresolved,
            StepError::Timeout(_) => ErrorCode::Timeout,
            StepError::Condition(_) => ErrorCode::ConditionFailed,
            StepError::RequiredActionFailed { .. } => ErrorCode::ActionFailed,
            StepError::InvalidConfiguration(_) | StepError::Context(_) => ErrorCode::InvalidState,
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match self {
            StepError::RequiredActionFailed { action_id, .. } => Some(action_id),
            _ => None,
        }
    }
}

/// Result of the type-specific part of a step, before actions run.
enum Body {
    Output(Value),
    Wait {
        reason: WaitReason,
        wakes: Vec<(WakeKind, DateTime<Utc>)>,
    },
    TimedOut(String),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching to type-specific handling.
#[derive(Clone)]
pub struct StepExecutor {
    capabilities: Capabilities,
    actions: ActionExecutor,
    conditions: ConditionEvaluator,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(capabilities: Capabilities, default_timeout: Duration) -> Self {
        Self {
            actions: ActionExecutor::new(&capabilities, default_timeout),
            conditions: ConditionEvaluator::new(capabilities.expressions.clone()),
            capabilities,
            default_timeout,
        }
    }

    pub fn actions(&self) -> &ActionExecutor {
        &self.actions
    }

    pub fn conditions(&self) -> &ConditionEvaluator {
        &self.conditions
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Run one visit of `step`.
    ///
    /// `iteration` is the 1-based visit count of a Loop step and is ignored
    /// for every other type.
    pub async fn run(
        &self,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        ctx: &mut ExecutionContext,
        iteration: u32,
    ) -> StepOutcome {
        let input = build_input(step, ctx);
        record.input_data = input.clone();

        debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            step_type = %step.step_type,
            "running step"
        );

        let body = match step.step_type {
            StepType::Start => Ok(Body::Output(json!({
                "started_at": self.capabilities.clock.now(),
                "initiated_by": ctx.initiated_by,
            }))),
            StepType::End => Ok(Body::Output(json!({
                "completed_at": self.capabilities.clock.now(),
            }))),
            StepType::Parallel => Ok(Body::Output(input)),
            StepType::Task
                if step.configuration.handler.is_none()
                    && !self.capabilities.handlers.contains(StepType::Task.as_str()) =>
            {
                Ok(Body::Output(input))
            }
            StepType::Task
            | StepType::ServiceTask
            | StepType::ScriptTask
            | StepType::EmailTask
            | StepType::SubWorkflow
            | StepType::Custom => self.run_handler(step, record, ctx, input).await,
            StepType::Decision | StepType::Gateway => self.run_decision(step, ctx),
            StepType::Loop => self.run_loop(step, ctx, iteration),
            StepType::UserTask => self.run_user_task(step, record, ctx).await,
            StepType::Event => Ok(self.run_event(step)),
            StepType::TimerTask => self.run_timer(step),
        };

        match body {
            Ok(Body::Output(output)) => self.complete(step, record, ctx, output).await,
            Ok(Body::Wait { reason, wakes }) => {
                record.status = StepExecutionStatus::Waiting;
                StepOutcome::Waiting { reason, wakes }
            }
            Ok(Body::TimedOut(message)) => StepOutcome::TimedOut { message },
            Err(err) => self.fail(record, err),
        }
    }

    /// Finish a step with `output`: store it, apply the output mapping, run
    /// the step's actions. Also used when a waiting step is signalled or its
    /// timer fires.
    pub async fn complete(
        &self,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        ctx: &mut ExecutionContext,
        output: Value,
    ) -> StepOutcome {
        match ctx.set_step_output(&step.id, output) {
            Ok(true) => warn!(step_id = %step.id, "step output truncated"),
            Ok(false) => {}
            Err(e) => return self.fail(record, e.into()),
        }
        record.output_data = ctx.get_step_output(&step.id).cloned();

        for (variable, path) in &step.configuration.output_mapping {
            let full = match path.trim() {
                "" | "." | "output" => format!("steps.{}", step.id),
                p => format!("steps.{}.output.{}", step.id, p),
            };
            match ctx.lookup(&full) {
                Some(value) => ctx.set_variable(variable.clone(), value),
                None => debug!(step_id = %step.id, variable, path, "output mapping path not found"),
            }
        }

        let scope = ActionScope {
            execution_id: ctx.execution_id,
            step_id: &step.id,
        };
        let (records, failure) = self
            .actions
            .execute_all(&step.actions, &ActionOrigin::Step, ctx, scope)
            .await;
        record.action_executions.extend(records);
        if let Some((action_id, message)) = failure {
            return self.fail(record, StepError::RequiredActionFailed { action_id, message });
        }

        record.status = StepExecutionStatus::Completed;
        record.completed_at = Some(self.capabilities.clock.now());
        StepOutcome::Completed
    }

    /// Record a failure on the step record.
    pub fn fail(&self, record: &mut WorkflowStepExecution, err: StepError) -> StepOutcome {
        record.status = StepExecutionStatus::Failed;
        record.error_code = Some(err.code());
        record.error_message = Some(err.to_string());
        record.completed_at = Some(self.capabilities.clock.now());
        StepOutcome::Failed(err)
    }

    // -----------------------------------------------------------------------
    // Handler-backed steps
    // -----------------------------------------------------------------------

    async fn run_handler(
        &self,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        ctx: &ExecutionContext,
        input: Value,
    ) -> Result<Body, StepError> {
        let tag = step
            .configuration
            .handler
            .clone()
            .unwrap_or_else(|| step.step_type.as_str().to_string());
        let handler = self
            .capabilities
            .handlers
            .get(&tag)
            .ok_or_else(|| StepError::HandlerNotFound(tag.clone()))?;

        let parameters = ctx.resolve_value(&Value::Object(
            step.configuration.parameters.clone().into_iter().collect(),
        ));
        let policy = step.retry.clone().unwrap_or_else(RetryHandler::single_attempt);
        let timeout = step
            .timeout
            .as_ref()
            .map(|t| Duration::from_secs(t.duration_secs))
            .unwrap_or(self.default_timeout);
        let timeout_action = step.timeout.as_ref().map(|t| t.action);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            record.attempts = attempt;
            let request = HandlerRequest {
                handler: tag.clone(),
                parameters: parameters.clone(),
                input: input.clone(),
                execution_id: ctx.execution_id,
                step_id: step.id.clone(),
                action_id: None,
                attempt,
            };

            let (message, code) = match tokio::time::timeout(timeout, handler.invoke(&request)).await {
                Ok(Ok(output)) => return Ok(Body::Output(output)),
                Ok(Err(e)) => (e.message, e.code),
                Err(_) => {
                    let message = format!("handler '{tag}' exceeded {}s", timeout.as_secs());
                    match timeout_action {
                        None | Some(TimeoutAction::Retry) => {}
                        Some(_) => return Ok(Body::TimedOut(message)),
                    }
                    if !RetryHandler::should_retry(&policy, attempt, Some("timeout")) {
                        return Err(StepError::Timeout(message));
                    }
                    (message, Some("timeout".to_string()))
                }
            };

            if !RetryHandler::should_retry(&policy, attempt, code.as_deref()) {
                return Err(StepError::HandlerExecutionFailed {
                    message,
                    attempts: attempt,
                });
            }

            let delay = RetryHandler::delay_for(&policy, attempt);
            warn!(
                execution_id = %ctx.execution_id,
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "step handler failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Structural steps
    // -----------------------------------------------------------------------

    /// Evaluate outcomes in order; the first match wins.
    fn run_decision(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> Result<Body, StepError> {
        for outcome in &step.configuration.outcomes {
            if self.conditions.evaluate(&outcome.condition, ctx)? {
                debug!(step_id = %step.id, outcome = %outcome.name, "decision outcome matched");
                return Ok(Body::Output(json!({
                    "result": true,
                    "outcome": outcome.name,
                    "matched": true,
                })));
            }
        }
        Ok(Body::Output(json!({
            "result": false,
            "outcome": "default",
            "matched": false,
        })))
    }

    fn run_loop(&self, step: &WorkflowStep, ctx: &ExecutionContext, iteration: u32) -> Result<Body, StepError> {
        let cfg = step
            .configuration
            .loop_config
            .as_ref()
            .ok_or_else(|| StepError::InvalidConfiguration(format!("loop step '{}' has no loop config", step.id)))?;
        let within = iteration <= cfg.max_iterations;
        let keep_going = within && self.conditions.holds(cfg.condition.as_ref(), ctx)?;
        debug!(step_id = %step.id, iteration, keep_going, "loop evaluated");
        Ok(Body::Output(json!({
            "iteration": iteration,
            "continue": keep_going,
            "max_iterations": cfg.max_iterations,
        })))
    }

    // -----------------------------------------------------------------------
    // Waiting steps
    // -----------------------------------------------------------------------

    async fn run_user_task(
        &self,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        ctx: &ExecutionContext,
    ) -> Result<Body, StepError> {
        let policy = step
            .configuration
            .assignment
            .as_ref()
            .ok_or_else(|| StepError::AssignmentUnresolved("no assignment policy".into()))?;
        let assignee = self
            .capabilities
            .assignments
            .resolve(policy, ctx)
            .await
            .map_err(|e| StepError::AssignmentUnresolved(e.message))?;
        record.assigned_to = Some(assignee);

        let now = self.capabilities.clock.now();
        let mut wakes = Vec::new();
        if let Some(escalation) = &step.configuration.escalation {
            wakes.push((WakeKind::Escalation, now + secs(escalation.after_secs)));
        }
        if let Some(timeout) = &step.timeout {
            wakes.push((WakeKind::Timeout, now + secs(timeout.duration_secs)));
        }
        Ok(Body::Wait {
            reason: WaitReason::UserTask,
            wakes,
        })
    }

    fn run_event(&self, step: &WorkflowStep) -> Body {
        let now = self.capabilities.clock.now();
        let wakes = step
            .timeout
            .as_ref()
            .map(|t| vec![(WakeKind::Timeout, now + secs(t.duration_secs))])
            .unwrap_or_default();
        Body::Wait {
            reason: WaitReason::Event,
            wakes,
        }
    }

    /// `duration_secs` (number or numeric string) or `until` (RFC 3339).
    fn run_timer(&self, step: &WorkflowStep) -> Result<Body, StepError> {
        let now = self.capabilities.clock.now();
        let params = &step.configuration.parameters;
        let duration = params.get("duration_secs").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        });
        let due = match (duration, step.configuration.param_str("until")) {
            (Some(d), _) => now + secs(d),
            (None, Some(until)) => DateTime::parse_from_rfc3339(until)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StepError::InvalidConfiguration(format!("timer 'until' is not RFC 3339: {e}")))?,
            (None, None) => {
                return Err(StepError::InvalidConfiguration(format!(
                    "timer step '{}' needs duration_secs or until",
                    step.id
                )));
            }
        };

        if due <= now {
            return Ok(Body::Output(json!({ "fired_at": now, "due_at": due })));
        }
        Ok(Body::Wait {
            reason: WaitReason::Timer,
            wakes: vec![(WakeKind::Timer, due)],
        })
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn secs(s: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000))
}

/// Context variables merged with the step's input mapping.
fn build_input(step: &WorkflowStep, ctx: &ExecutionContext) -> Value {
    let mut input: Map<String, Value> = ctx
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, path) in &step.configuration.input_mapping {
        input.insert(key.clone(), ctx.lookup(path).unwrap_or(Value::Null));
    }
    Value::Object(input)
}
