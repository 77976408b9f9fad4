//! Workflow definition types: the authored process graph.
//!
//! A `WorkflowDefinition` is the immutable-after-publish input to the engine.
//! YAML files, JSON payloads and programmatic builders all convert to this
//! struct. Steps are nodes, transitions are directed (optionally conditional)
//! edges between them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::WorkflowAction;
use crate::condition::WorkflowCondition;
use crate::config::DeadEndPolicy;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Owning tenant. Required before a definition may be activated.
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic definition version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Lifecycle status. Only `active` and `published` definitions execute.
    #[serde(default)]
    pub status: DefinitionStatus,
    /// Ordered step list. Declaration order is significant for tie-breaks.
    pub steps: Vec<WorkflowStep>,
    /// Directed edges between steps.
    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
    /// How instances of this workflow are started.
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Declared process variables.
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
    #[serde(default)]
    pub security: SecurityPolicy,
    #[serde(default)]
    pub configuration: WorkflowConfiguration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The first step flagged `is_start_step`, in declaration order.
    pub fn start_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.is_start_step)
    }

    /// Outgoing transitions of a step, paired with their declaration index.
    pub fn outgoing(&self, step_id: &str) -> Vec<(usize, &WorkflowTransition)> {
        self.transitions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.from_step_id == step_id)
            .collect()
    }

    /// Whether the definition status allows execution.
    pub fn is_executable(&self) -> bool {
        matches!(
            self.status,
            DefinitionStatus::Active | DefinitionStatus::Published
        )
    }
}

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Active,
    Published,
    Inactive,
    Archived,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step ID. Unique within a definition.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub configuration: StepConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Side effects run in declared order after the step body succeeds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<WorkflowAction>,
    #[serde(default)]
    pub is_start_step: bool,
    #[serde(default)]
    pub is_end_step: bool,
    /// Non-critical step: a failure does not fail the execution, the engine
    /// moves on to transition resolution instead.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    /// Build a bare step of the given type. Mostly used by builders and tests.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            configuration: StepConfiguration::default(),
            timeout: None,
            retry: None,
            actions: Vec::new(),
            is_start_step: matches!(step_type, StepType::Start),
            is_end_step: matches!(step_type, StepType::End),
            continue_on_error: false,
        }
    }

    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// The kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    End,
    Task,
    Decision,
    Parallel,
    Loop,
    SubWorkflow,
    UserTask,
    ServiceTask,
    ScriptTask,
    EmailTask,
    TimerTask,
    Gateway,
    Event,
    Custom,
}

impl StepType {
    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Start => "start",
            StepType::End => "end",
            StepType::Task => "task",
            StepType::Decision => "decision",
            StepType::Parallel => "parallel",
            StepType::Loop => "loop",
            StepType::SubWorkflow => "sub_workflow",
            StepType::UserTask => "user_task",
            StepType::ServiceTask => "service_task",
            StepType::ScriptTask => "script_task",
            StepType::EmailTask => "email_task",
            StepType::TimerTask => "timer_task",
            StepType::Gateway => "gateway",
            StepType::Event => "event",
            StepType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-specific configuration.
///
/// Which fields matter depends on the step type: `handler`/`parameters` for
/// handler-backed tasks, `assignment`/`escalation` for user tasks,
/// `outcomes` for decisions and gateways, `loop_config` and `parallel` for
/// the structural step types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfiguration {
    /// Registered handler tag. Overrides the type's default tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Handler parameters. String values support `{{ ... }}` templates.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<AssignmentPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPolicy>,
    /// Step input key -> context path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Context variable -> path inside the step output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// Named outcomes evaluated in order by decision/gateway steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<DecisionOutcome>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelConfig>,
}

impl StepConfiguration {
    /// Read a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Whether a parameter is present and not an empty string / null.
    pub fn has_param(&self, key: &str) -> bool {
        match self.parameters.get(key) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }
}

/// How a user task picks its assignee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPolicy {
    #[serde(rename = "type")]
    pub assignment_type: AssignmentType,
    /// Direct principal (user ID, `role:<name>`, `group:<name>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Rule reference for rule-based assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl AssignmentPolicy {
    /// Direct assignment to a single principal.
    pub fn direct(assignment_type: AssignmentType, assignee: impl Into<String>) -> Self {
        Self {
            assignment_type,
            assignee: Some(assignee.into()),
            rule: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    User,
    Role,
    Group,
    Rule,
    System,
}

/// Escalation of an unacted-upon user task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Seconds after activation before escalation fires.
    pub after_secs: u64,
    /// New assignee once escalated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,
    /// Invoke the `escalation` handler when firing.
    #[serde(default)]
    pub notify: bool,
}

/// What happens when a step exceeds its allotted time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub duration_secs: u64,
    #[serde(default)]
    pub action: TimeoutAction,
    /// Target for `go_to_step`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Cancel,
    Complete,
    Escalate,
    Retry,
    Skip,
    GoToStep,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded retry policy shared by steps and actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Upper bound on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Only retry errors with one of these codes (empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<String>,
    /// Never retry errors with one of these codes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            delay_ms,
            strategy,
            max_delay_ms: None,
            retry_on: Vec::new(),
            no_retry_on: Vec::new(),
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Structural step configuration
// ---------------------------------------------------------------------------

/// A named branch outcome for decision and gateway steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub name: String,
    pub condition: WorkflowCondition,
}

/// Configuration of an explicit loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Loop continues while this holds (absent = until `max_iterations`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<WorkflowCondition>,
    pub max_iterations: u32,
}

/// Fan-out/join configuration of a parallel gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Step where all branches converge.
    pub join_step_id: String,
    /// Branches that must complete (absent = all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A directed, optionally conditional edge between two steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub from_step_id: String,
    pub to_step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<WorkflowCondition>,
    #[serde(rename = "type", default)]
    pub transition_type: TransitionType,
    /// Lower is evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Side effects fired once per traversal, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<WorkflowAction>,
}

impl WorkflowTransition {
    /// Unconditional sequence transition.
    pub fn new(
        id: impl Into<String>,
        from_step_id: impl Into<String>,
        to_step_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            from_step_id: from_step_id.into(),
            to_step_id: to_step_id.into(),
            condition: None,
            transition_type: TransitionType::Sequence,
            priority: 0,
            actions: Vec::new(),
        }
    }

    /// Conditional transition.
    pub fn when(mut self, condition: WorkflowCondition) -> Self {
        self.condition = Some(condition);
        self.transition_type = TransitionType::Conditional;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Taken when no conditional sibling matches.
    pub fn is_fallback(&self) -> bool {
        self.transition_type == TransitionType::Default || self.condition.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    #[default]
    Sequence,
    Conditional,
    Default,
    /// Only considered when the source step failed (non-critical steps).
    Exception,
    Timer,
    Message,
    Signal,
}

// ---------------------------------------------------------------------------
// Variables, security, configuration, trigger
// ---------------------------------------------------------------------------

/// A declared process variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub variable_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
    Date,
}

/// Access policy. The engine only checks it for internal consistency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub require_authentication: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_users: Vec<String>,
}

/// Per-definition overrides of engine behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    /// Loop-guard ceiling for this definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Wall-clock budget for one drive of the run loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub parallel_execution_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_end_policy: Option<DeadEndPolicy>,
}

/// How instances are started. Validated data only; the engine never fires
/// triggers itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Manual {},
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Event {
        event_type: String,
    },
    Webhook {
        path: String,
    },
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig::Manual {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
