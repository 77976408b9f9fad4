//! Execution tracking types: the live (and finished) instance of a workflow.
//!
//! A `WorkflowExecution` owns the ordered audit trail of step visits and the
//! durable `ExecutionCursor` the run loop resumes from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::ActionType;
use crate::context::ExecutionContext;
use crate::definition::StepType;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Suspended,
    Timeout,
    /// Stopped by an engine guard (the step-visit ceiling) rather than by a
    /// failing step.
    Aborted,
}

impl ExecutionStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
                | ExecutionStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "suspended" => Ok(ExecutionStatus::Suspended),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "aborted" => Ok(ExecutionStatus::Aborted),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Status of one step visit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Waiting,
    Timeout,
}

/// Status of one action run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// Stable machine-readable failure codes carried by the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidState,
    NoStartStep,
    NoValidTransition,
    MaxStepsExceeded,
    HandlerNotFound,
    HandlerExecutionFailed,
    AssignmentUnresolved,
    Timeout,
    Cancelled,
    ActionFailed,
    ConditionFailed,
    ParallelJoinFailed,
    IllegalRevisit,
    MissingVariable,
    StepNotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::NoStartStep => "no_start_step",
            ErrorCode::NoValidTransition => "no_valid_transition",
            ErrorCode::MaxStepsExceeded => "max_steps_exceeded",
            ErrorCode::HandlerNotFound => "handler_not_found",
            ErrorCode::HandlerExecutionFailed => "handler_execution_failed",
            ErrorCode::AssignmentUnresolved => "assignment_unresolved",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::ActionFailed => "action_failed",
            ErrorCode::ConditionFailed => "condition_failed",
            ErrorCode::ParallelJoinFailed => "parallel_join_failed",
            ErrorCode::IllegalRevisit => "illegal_revisit",
            ErrorCode::MissingVariable => "missing_variable",
            ErrorCode::StepNotFound => "step_not_found",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Where the durable run loop stands.
///
/// The run loop is a function of (definition, execution), so any persisted
/// cursor can be resumed after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionCursor {
    /// Nothing has run yet.
    #[default]
    Start,
    /// The step is about to be (re-)executed.
    Step { step_id: String },
    /// The step finished; the next hop has not been resolved.
    Transition { from_step_id: String },
    /// Parked until a signal or a wake.
    Waiting { step_id: String, reason: WaitReason },
    /// No further work.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    UserTask,
    Timer,
    Event,
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// One run of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Denormalized for display.
    pub workflow_name: String,
    /// Definition version this execution is pinned to.
    pub version: u32,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    #[serde(default)]
    pub cursor: ExecutionCursor,
    /// Ordered audit trail, one record per step visit.
    #[serde(default)]
    pub step_executions: Vec<WorkflowStepExecution>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Loop-guard counter.
    #[serde(default)]
    pub steps_executed: u32,
    /// Visits per loop step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loop_iterations: BTreeMap<String, u32>,
    /// Join bookkeeping for parallel gateways.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinState>,
    /// Step that may be visited again without an intervening loop step
    /// (set by `go_to_step` timeouts and timeout retries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_revisit: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// A fresh `Pending` execution.
    pub fn new(
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        version: u32,
        context: ExecutionContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_name: workflow_name.into(),
            version,
            status: ExecutionStatus::Pending,
            context,
            cursor: ExecutionCursor::Start,
            step_executions: Vec::new(),
            metrics: ExecutionMetrics::default(),
            failure: None,
            error_message: None,
            steps_executed: 0,
            loop_iterations: BTreeMap::new(),
            joins: Vec::new(),
            authorized_revisit: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Most recent visit of a step.
    pub fn last_step_execution(&self, step_id: &str) -> Option<&WorkflowStepExecution> {
        self.step_executions.iter().rev().find(|s| s.step_id == step_id)
    }

    pub fn last_step_execution_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStepExecution> {
        self.step_executions
            .iter_mut()
            .rev()
            .find(|s| s.step_id == step_id)
    }

    /// Step the execution is parked on, if any.
    pub fn waiting_step(&self) -> Option<&str> {
        match &self.cursor {
            ExecutionCursor::Waiting { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Record a fatal failure.
    pub fn fail(&mut self, failure: ExecutionFailure) {
        self.error_message = Some(failure.message.clone());
        self.failure = Some(failure);
    }
}

/// Why an execution ended in a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl ExecutionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id: None,
            action_id: None,
            attempts: 0,
        }
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

// ---------------------------------------------------------------------------
// Step and action records
// ---------------------------------------------------------------------------

/// One visit of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    /// Step actions followed by the actions of the transition taken out of it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_executions: Vec<WorkflowActionExecution>,
    /// Handler invocations made for this visit.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalated: bool,
    /// Durable wakes pending for this visit while it waits. Persisted with
    /// the record so a restart can re-arm any wake row that was lost.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub armed_wakes: Vec<ScheduledWake>,
}

impl WorkflowStepExecution {
    pub fn new(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        step_type: StepType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            step_name: step_name.into(),
            step_type,
            status: StepExecutionStatus::Running,
            assigned_to: None,
            input_data: Value::Null,
            output_data: None,
            action_executions: Vec::new(),
            attempts: 0,
            error_code: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            escalated: false,
            armed_wakes: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            StepExecutionStatus::Completed
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Skipped
                | StepExecutionStatus::Timeout
        )
    }

    /// Milliseconds between start and completion (0 while unfinished).
    pub fn duration_ms(&self) -> u64 {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Where an action was declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOrigin {
    #[default]
    Step,
    Transition { transition_id: String },
}

/// One run of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowActionExecution {
    pub id: Uuid,
    pub action_id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub origin: ActionOrigin,
    pub status: ActionExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Condition evaluated false; the action did not run.
    #[serde(default)]
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Metrics, joins, wakes
// ---------------------------------------------------------------------------

/// Aggregated counters, recomputed from the trail when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_duration_ms: u64,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub actions_executed: u32,
    pub actions_failed: u32,
    pub actions_skipped: u32,
    /// Attempts beyond the first, across steps and actions.
    pub retries: u32,
}

/// Join bookkeeping for one activation of a parallel gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinState {
    pub gateway_step_id: String,
    pub join_step_id: String,
    pub branches: Vec<BranchState>,
    /// Branches that must complete for the join to succeed.
    pub required: u32,
}

impl JoinState {
    pub fn completed(&self) -> u32 {
        self.branches
            .iter()
            .filter(|b| b.status == StepExecutionStatus::Completed)
            .count() as u32
    }

    pub fn failed(&self) -> u32 {
        self.branches
            .iter()
            .filter(|b| b.status == StepExecutionStatus::Failed)
            .count() as u32
    }

    pub fn is_satisfied(&self) -> bool {
        self.completed() >= self.required
    }
}

/// Outcome of a single parallel branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchState {
    pub transition_id: String,
    pub first_step_id: String,
    pub status: StepExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A durable timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWake {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: WakeKind,
    pub due_at: DateTime<Utc>,
}

impl ScheduledWake {
    pub fn new(execution_id: Uuid, step_id: impl Into<String>, kind: WakeKind, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step_id.into(),
            kind,
            due_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeKind {
    /// Timer task elapsed.
    Timer,
    /// Step timeout policy fires.
    Timeout,
    /// User task escalation fires.
    Escalation,
}

impl WakeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeKind::Timer => "timer",
            WakeKind::Timeout => "timeout",
            WakeKind::Escalation => "escalation",
        }
    }
}

impl std::str::FromStr for WakeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(WakeKind::Timer),
            "timeout" => Ok(WakeKind::Timeout),
            "escalation" => Ok(WakeKind::Escalation),
            other => Err(format!("unknown wake kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
