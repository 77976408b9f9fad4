//! Workflow engine: the durable, re-entrant run loop.
//!
//! `WorkflowEngine` drives one execution at a time per instance through its
//! definition. The run loop is a function of (definition, execution record)
//! only: every step boundary moves the persisted `ExecutionCursor` and
//! checkpoints the record, so a run can be resumed from storage after a
//! restart, a human approval or a timer.
//!
//! # Execution flow
//!
//! 1. `prepare` checks the definition status and start step, seeds declared
//!    variable defaults and creates a `Pending` execution.
//! 2. `drive` acquires a concurrency permit and loops over the cursor:
//!    `Step` runs the step, `Transition` resolves the next hop, `Waiting`
//!    and `Finished` stop the loop.
//! 3. Waiting steps are resumed by `signal` (user tasks, catch events) or by
//!    `process_due_wakes` (timers, timeouts, escalations).
//! 4. Cancellation and suspension are requested from outside and observed at
//!    the next step boundary; a cancelled in-flight step is discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use stepwise_types::config::{DeadEndPolicy, EngineConfig};
use stepwise_types::context::ExecutionContext;
use stepwise_types::definition::{ParallelConfig, StepType, TimeoutAction, WorkflowDefinition, WorkflowStep};
use stepwise_types::error::RepositoryError;
use stepwise_types::event::EngineEvent;
use stepwise_types::execution::{
    ActionExecutionStatus, ErrorCode, ExecutionCursor, ExecutionFailure, ExecutionMetrics, ExecutionStatus,
    ScheduledWake, StepExecutionStatus, WaitReason, WakeKind, WorkflowExecution, WorkflowStepExecution,
};
use stepwise_types::validation::ValidationReport;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::execution::ExecutionRepository;

use super::capability::{
    AssignmentResolver, Capabilities, ExpressionEvaluator, HandlerRequest, StepHandler, tags,
};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::clock::Clock;
use super::parallel::{ParallelError, ParallelRunner};
use super::step_runner::{StepError, StepExecutor, StepOutcome, secs};
use super::transition::TransitionResolver;
use super::validator::validate_definition;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by the engine's public operations.
///
/// Step, action and transition failures are not errors here: they end the
/// execution with a `Failed` status and an `ExecutionFailure` on the record.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("definition '{0}' has no start step")]
    NoStartStep(String),

    #[error("required variable '{0}' has no value")]
    MissingVariable(String),

    #[error("definition not found: {0}")]
    DefinitionNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("step '{step_id}' of execution {execution_id} is not waiting for a signal")]
    StepNotWaiting { execution_id: Uuid, step_id: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Audit-trail code matching this error, where one exists.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            EngineError::InvalidState(_) | EngineError::StepNotWaiting { .. } => Some(ErrorCode::InvalidState),
            EngineError::NoStartStep(_) => Some(ErrorCode::NoStartStep),
            EngineError::MissingVariable(_) => Some(ErrorCode::MissingVariable),
            _ => None,
        }
    }
}

/// Out-of-band request observed by the run loop at the next step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Cancel,
    Suspend,
}

/// How a step visit ended, after timeout policies have been applied.
enum Visit {
    Outcome(StepOutcome),
    TimedOut(String),
    Skipped,
    Jump(String),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Durable workflow engine.
///
/// Generic over `R: ExecutionRepository` for storage flexibility.
pub struct WorkflowEngine<R: ExecutionRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    event_bus: EventBus,
    config: EngineConfig,
    capabilities: Capabilities,
    steps: StepExecutor,
    transitions: TransitionResolver,
    parallel: ParallelRunner,
    /// Single-writer lock per execution.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Bounds the number of executions driving the run loop at once.
    permits: Arc<Semaphore>,
    /// Cancellation tokens of executions currently being driven.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    stop_requests: DashMap<Uuid, StopRequest>,
}

fn wire(
    capabilities: &Capabilities,
    config: &EngineConfig,
    events: &EventBus,
) -> (StepExecutor, TransitionResolver, ParallelRunner) {
    let steps = StepExecutor::new(
        capabilities.clone(),
        Duration::from_secs(config.default_step_timeout_secs),
    );
    let transitions = TransitionResolver::new(steps.actions().clone(), steps.conditions().clone());
    let parallel = ParallelRunner::new(steps.clone(), transitions.clone(), events.clone());
    (steps, transitions, parallel)
}

impl<R: ExecutionRepository + 'static> WorkflowEngine<R> {
    /// Create an engine with default capabilities (no handlers, direct
    /// assignment, JEXL expressions, system clock).
    pub fn new(repo: R, config: EngineConfig) -> Self {
        let capabilities = Capabilities::default();
        let event_bus = EventBus::new(config.event_bus_capacity);
        let (steps, transitions, parallel) = wire(&capabilities, &config, &event_bus);
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            event_bus,
            config,
            capabilities,
            steps,
            transitions,
            parallel,
            locks: DashMap::new(),
            cancellation_tokens: DashMap::new(),
            stop_requests: DashMap::new(),
        }
    }

    fn rewire(mut self) -> Self {
        let (steps, transitions, parallel) = wire(&self.capabilities, &self.config, &self.event_bus);
        self.steps = steps;
        self.transitions = transitions;
        self.parallel = parallel;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self.rewire()
    }

    /// Register a handler under `tag`.
    pub fn with_handler(mut self, tag: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Arc::make_mut(&mut self.capabilities.handlers).register(tag, handler);
        self.rewire()
    }

    pub fn with_assignment_resolver(mut self, resolver: Arc<dyn AssignmentResolver>) -> Self {
        self.capabilities.assignments = resolver;
        self.rewire()
    }

    pub fn with_expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.capabilities.expressions = evaluator;
        self.rewire()
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.capabilities.clock = clock;
        self.rewire()
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self.rewire()
    }

    pub fn repository(&self) -> &R {
        self.checkpoint.repo()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.capabilities.clock.as_ref()
    }

    fn now(&self) -> DateTime<Utc> {
        self.capabilities.clock.now()
    }

    fn lock_for(&self, execution_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(execution_id).or_default().clone()
    }

    /// Forget the lock of a finished execution.
    fn release(&self, exec: &WorkflowExecution) {
        if exec.status.is_terminal() {
            self.locks.remove(&exec.id);
        }
    }

    async fn save(&self, exec: &mut WorkflowExecution) -> Result<(), EngineError> {
        self.checkpoint.save(exec, self.now()).await?;
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.checkpoint
            .load(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    async fn definition_for(&self, exec: &WorkflowExecution) -> Result<WorkflowDefinition, EngineError> {
        self.repository()
            .get_definition_version(&exec.workflow_id, exec.version)
            .await?
            .ok_or(EngineError::DefinitionNotFound(exec.workflow_id))
    }

    fn max_steps(&self, def: &WorkflowDefinition) -> u32 {
        def.configuration
            .max_steps
            .unwrap_or(self.config.max_steps_per_execution)
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Run `def` against `context` until the execution finishes or parks.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut exec = self.prepare(def, context).await?;
        let lock = self.lock_for(exec.id);
        let _guard = lock.lock().await;

        self.begin(&mut exec);
        self.drive(def, &mut exec).await?;
        self.release(&exec);
        Ok(exec)
    }

    /// Load the latest version of a stored definition and execute it.
    pub async fn execute_by_id(
        &self,
        definition_id: Uuid,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution, EngineError> {
        let def = self
            .repository()
            .get_definition(&definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;
        self.execute(&def, context).await
    }

    /// Persist a `Pending` execution and drive it on a background task.
    pub async fn start(
        self: &Arc<Self>,
        def: &WorkflowDefinition,
        context: ExecutionContext,
    ) -> Result<Uuid, EngineError> {
        let mut exec = self.prepare(def, context).await?;
        self.save(&mut exec).await?;

        let execution_id = exec.id;
        let engine = Arc::clone(self);
        let def = def.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.drive_persisted(&def, execution_id).await {
                error!(execution_id = %execution_id, error = %e, "background execution failed");
            }
        });
        Ok(execution_id)
    }

    /// Complete a waiting user task or catch event with `output` and resume.
    pub async fn signal(
        &self,
        execution_id: Uuid,
        step_id: &str,
        output: Value,
    ) -> Result<WorkflowExecution, EngineError> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        ensure_live(&exec)?;
        let waiting = matches!(
            &exec.cursor,
            ExecutionCursor::Waiting { step_id: s, reason } if s == step_id && *reason != WaitReason::Timer
        );
        if !waiting {
            return Err(EngineError::StepNotWaiting {
                execution_id,
                step_id: step_id.to_string(),
            });
        }

        let def = self.definition_for(&exec).await?;
        let step = def
            .step(step_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidState(format!("step '{step_id}' not in definition")))?;

        info!(execution_id = %execution_id, step_id, "signal received");
        self.complete_waiting(&def, &mut exec, &step, output).await?;
        self.drive(&def, &mut exec).await?;
        self.release(&exec);
        Ok(exec)
    }

    /// Cancel an execution. A running step is abandoned at once and its
    /// result discarded; a waiting execution is cancelled in place.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.stop_requests.insert(execution_id, StopRequest::Cancel);
        if let Some(token) = self.cancellation_tokens.get(&execution_id) {
            token.cancel();
        }

        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;
        self.stop_requests.remove(&execution_id);

        let mut exec = self.load(execution_id).await?;
        match exec.status {
            ExecutionStatus::Cancelled => {}
            status if status.is_terminal() => {
                return Err(EngineError::InvalidState(format!("execution already {status}")));
            }
            _ => self.cancel_now(&mut exec).await?,
        }
        self.release(&exec);
        Ok(exec)
    }

    /// Pause an execution at its next step boundary.
    pub async fn suspend(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.stop_requests
            .entry(execution_id)
            .or_insert(StopRequest::Suspend);

        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;
        self.stop_requests
            .remove_if(&execution_id, |_, request| *request == StopRequest::Suspend);

        let mut exec = self.load(execution_id).await?;
        match exec.status {
            ExecutionStatus::Suspended => {}
            status if status.is_terminal() => {
                return Err(EngineError::InvalidState(format!("execution already {status}")));
            }
            _ => self.suspend_now(&mut exec).await?,
        }
        Ok(exec)
    }

    /// Resume a suspended execution.
    pub async fn resume(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if exec.status != ExecutionStatus::Suspended {
            return Err(EngineError::InvalidState(format!(
                "execution is {}, not suspended",
                exec.status
            )));
        }
        exec.status = ExecutionStatus::Running;
        info!(execution_id = %execution_id, "execution resumed");

        if exec.waiting_step().is_some() {
            self.save(&mut exec).await?;
        } else {
            let def = self.definition_for(&exec).await?;
            self.drive(&def, &mut exec).await?;
        }
        self.release(&exec);
        Ok(exec)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.load(execution_id).await
    }

    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.repository().list_executions(status).await?)
    }

    /// Validate the latest version of a stored definition.
    pub async fn validate(&self, definition_id: Uuid) -> Result<ValidationReport, EngineError> {
        let def = self
            .repository()
            .get_definition(&definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;
        Ok(validate_definition(&def))
    }

    /// Validate a definition and store it when it has no errors.
    pub async fn register(&self, def: &WorkflowDefinition) -> Result<ValidationReport, EngineError> {
        let report = validate_definition(def);
        if report.is_valid() {
            self.repository().save_definition(def).await?;
            info!(workflow_id = %def.id, version = def.version, name = %def.name, "definition registered");
        } else {
            warn!(
                workflow_id = %def.id,
                errors = report.errors.len(),
                "definition rejected by validation"
            );
        }
        Ok(report)
    }

    /// Fire every durable wake due at or before `now`. Returns the number of
    /// wakes that acted on an execution.
    pub async fn process_due_wakes(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let wakes = self.repository().due_wakes(now).await?;
        let mut fired = 0;
        for wake in wakes {
            match self.fire_wake(wake.execution_id, &wake.step_id, wake.kind, wake.id, wake.due_at).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    execution_id = %wake.execution_id,
                    step_id = %wake.step_id,
                    kind = wake.kind.as_str(),
                    error = %e,
                    "failed to fire wake"
                ),
            }
        }
        Ok(fired)
    }

    /// Re-drive executions persisted mid-run (crash recovery). Executions
    /// parked on a waiting step keep waiting for their signals and wakes;
    /// any wake row missing for them is armed again. Returns the ids of the
    /// re-driven executions.
    pub async fn recover(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut candidates = Vec::new();
        for status in [ExecutionStatus::Running, ExecutionStatus::Pending, ExecutionStatus::Suspended] {
            candidates.extend(self.repository().list_executions(Some(status)).await?);
        }

        let mut recovered = Vec::new();
        for exec in candidates {
            if let Some(step_id) = exec.waiting_step() {
                let armed = exec
                    .last_step_execution(step_id)
                    .map(|r| r.armed_wakes.as_slice())
                    .unwrap_or_default();
                if !armed.is_empty() {
                    debug!(execution_id = %exec.id, step_id, wakes = armed.len(), "re-arming wakes");
                    self.checkpoint.arm_wakes(armed).await?;
                }
                continue;
            }
            if exec.status == ExecutionStatus::Suspended {
                continue;
            }
            let def = match self.definition_for(&exec).await {
                Ok(def) => def,
                Err(e) => {
                    warn!(execution_id = %exec.id, error = %e, "cannot recover execution");
                    continue;
                }
            };
            info!(execution_id = %exec.id, cursor = ?exec.cursor, "recovering execution");
            match self.drive_persisted(&def, exec.id).await {
                Ok(_) => recovered.push(exec.id),
                Err(e) => warn!(execution_id = %exec.id, error = %e, "recovery failed"),
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Start-up
    // -----------------------------------------------------------------------

    async fn prepare(
        &self,
        def: &WorkflowDefinition,
        context: ExecutionContext,
    ) -> Result<WorkflowExecution, EngineError> {
        if !def.is_executable() {
            return Err(EngineError::InvalidState(format!(
                "definition '{}' is not active or published",
                def.name
            )));
        }
        if def.start_step().is_none() {
            return Err(EngineError::NoStartStep(def.name.clone()));
        }

        let mut context = context;
        for variable in &def.variables {
            if context.variables.contains_key(&variable.name) {
                continue;
            }
            match &variable.default_value {
                Some(value) => context.set_variable(variable.name.clone(), value.clone()),
                None if variable.required => return Err(EngineError::MissingVariable(variable.name.clone())),
                None => {}
            }
        }

        if self
            .repository()
            .get_definition_version(&def.id, def.version)
            .await?
            .is_none()
        {
            self.repository().save_definition(def).await?;
        }

        let mut exec = WorkflowExecution::new(def.id, &def.name, def.version, context, self.now());
        exec.context.execution_id = exec.id;
        exec.context.workflow_name = def.name.clone();
        Ok(exec)
    }

    fn begin(&self, exec: &mut WorkflowExecution) {
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(self.now());
        info!(execution_id = %exec.id, workflow = %exec.workflow_name, "execution started");
        self.event_bus.publish(EngineEvent::ExecutionStarted {
            execution_id: exec.id,
            workflow_id: exec.workflow_id,
            workflow_name: exec.workflow_name.clone(),
        });
    }

    async fn drive_persisted(
        &self,
        def: &WorkflowDefinition,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if exec.status.is_terminal() || exec.status == ExecutionStatus::Suspended || exec.waiting_step().is_some() {
            return Ok(exec);
        }
        if exec.status == ExecutionStatus::Pending {
            self.begin(&mut exec);
        }
        self.drive(def, &mut exec).await?;
        self.release(&exec);
        Ok(exec)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(&self, def: &WorkflowDefinition, exec: &mut WorkflowExecution) -> Result<(), EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::InvalidState("engine is shutting down".into()))?;

        let token = CancellationToken::new();
        self.cancellation_tokens.insert(exec.id, token.clone());

        let result = match def.configuration.timeout_secs {
            Some(limit) => {
                let bounded = tokio::time::timeout(
                    Duration::from_secs(limit),
                    self.run_loop(def, exec, &token),
                )
                .await;
                match bounded {
                    Ok(result) => result,
                    Err(_) => self.time_out_execution(exec, limit).await,
                }
            }
            None => self.run_loop(def, exec, &token).await,
        };

        self.cancellation_tokens.remove(&exec.id);
        result
    }

    async fn run_loop(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let max_steps = self.max_steps(def);
        loop {
            if exec.status != ExecutionStatus::Running {
                return Ok(());
            }
            if let Some((_, request)) = self.stop_requests.remove(&exec.id) {
                return match request {
                    StopRequest::Cancel => self.cancel_now(exec).await,
                    StopRequest::Suspend => self.suspend_now(exec).await,
                };
            }

            match exec.cursor.clone() {
                ExecutionCursor::Start => match def.start_step() {
                    Some(start) => {
                        exec.cursor = ExecutionCursor::Step {
                            step_id: start.id.clone(),
                        };
                    }
                    None => {
                        let failure = ExecutionFailure::new(ErrorCode::NoStartStep, "definition has no start step");
                        return self.fail(exec, failure).await;
                    }
                },
                ExecutionCursor::Step { step_id } => self.visit(def, exec, &step_id, max_steps, token).await?,
                ExecutionCursor::Transition { from_step_id } => self.advance(def, exec, &from_step_id).await?,
                ExecutionCursor::Waiting { .. } | ExecutionCursor::Finished => return Ok(()),
            }
        }
    }

    /// Execute the step under the cursor.
    async fn visit(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        step_id: &str,
        max_steps: u32,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(step) = def.step(step_id) else {
            let failure = ExecutionFailure::new(ErrorCode::StepNotFound, format!("step '{step_id}' not found"))
                .at_step(step_id);
            return self.fail(exec, failure).await;
        };

        discard_interrupted(exec, step);

        if exec.steps_executed >= max_steps {
            let failure = ExecutionFailure::new(
                ErrorCode::MaxStepsExceeded,
                format!("execution exceeded {max_steps} step visits"),
            )
            .at_step(&step.id);
            return self.finish(exec, ExecutionStatus::Aborted, Some(failure)).await;
        }
        if !revisit_allowed(exec, step) {
            let failure = ExecutionFailure::new(
                ErrorCode::IllegalRevisit,
                format!("step '{}' revisited without an intervening loop step", step.id),
            )
            .at_step(&step.id);
            return self.fail(exec, failure).await;
        }
        if exec.authorized_revisit.as_deref() == Some(step.id.as_str()) {
            exec.authorized_revisit = None;
        }

        let iteration = if step.step_type == StepType::Loop {
            let n = exec.loop_iterations.entry(step.id.clone()).or_insert(0);
            *n += 1;
            *n
        } else {
            1
        };
        exec.steps_executed += 1;

        let mut record = WorkflowStepExecution::new(&step.id, step.display_name(), step.step_type, self.now());
        exec.step_executions.push(record.clone());
        self.save(exec).await?;
        self.event_bus.publish(EngineEvent::StepStarted {
            execution_id: exec.id,
            step_id: step.id.clone(),
            step_type: step.step_type.to_string(),
        });

        let mut ctx = exec.context.clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = self.steps.run(step, &mut record, &mut ctx, iteration) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            record.status = StepExecutionStatus::Failed;
            record.error_code = Some(ErrorCode::Cancelled);
            record.error_message = Some("execution cancelled while the step was running".to_string());
            record.completed_at = Some(self.now());
            replace_last(exec, record);
            return self.cancel_now(exec).await;
        };

        exec.context = ctx;
        let visit = match outcome {
            StepOutcome::TimedOut { message } => {
                self.sync_timeout(step, &mut record, &mut exec.context, message)
                    .await
            }
            other => Visit::Outcome(other),
        };
        replace_last(exec, record);
        self.settle(def, exec, step, visit).await
    }

    /// Apply a synchronous step's timeout policy.
    async fn sync_timeout(
        &self,
        step: &WorkflowStep,
        record: &mut WorkflowStepExecution,
        ctx: &mut ExecutionContext,
        message: String,
    ) -> Visit {
        let action = step.timeout.as_ref().map(|t| t.action).unwrap_or_default();
        warn!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            action = ?action,
            "step timed out"
        );
        match action {
            TimeoutAction::Complete => Visit::Outcome(
                self.steps
                    .complete(step, record, ctx, json!({ "timed_out": true }))
                    .await,
            ),
            TimeoutAction::Escalate => Visit::Outcome(self.steps.fail(record, StepError::Timeout(message))),
            TimeoutAction::Skip => {
                record.status = StepExecutionStatus::Skipped;
                record.error_message = Some(message);
                record.completed_at = Some(self.now());
                Visit::Skipped
            }
            TimeoutAction::GoToStep => {
                mark_timed_out(record, &message, self.now());
                match step.timeout.as_ref().and_then(|t| t.target_step_id.clone()) {
                    Some(target) => Visit::Jump(target),
                    None => Visit::TimedOut(message),
                }
            }
            TimeoutAction::Cancel | TimeoutAction::Retry => {
                mark_timed_out(record, &message, self.now());
                Visit::TimedOut(message)
            }
        }
    }

    /// Move the cursor according to how a step visit ended.
    async fn settle(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        step: &WorkflowStep,
        visit: Visit,
    ) -> Result<(), EngineError> {
        match visit {
            Visit::Outcome(StepOutcome::Completed) => {
                let duration_ms = exec
                    .last_step_execution(&step.id)
                    .map(WorkflowStepExecution::duration_ms)
                    .unwrap_or(0);
                debug!(execution_id = %exec.id, step_id = %step.id, duration_ms, "step completed");
                self.event_bus.publish(EngineEvent::StepCompleted {
                    execution_id: exec.id,
                    step_id: step.id.clone(),
                    duration_ms,
                });

                if step.step_type == StepType::Loop
                    && exec
                        .context
                        .lookup(&format!("steps.{}.output.continue", step.id))
                        != Some(Value::Bool(true))
                {
                    exec.loop_iterations.remove(&step.id);
                }
                if step.step_type == StepType::Parallel && def.configuration.parallel_execution_enabled {
                    if let Some(config) = &step.configuration.parallel {
                        return self.join_parallel(def, exec, step, config).await;
                    }
                }
                if step.is_end_step {
                    return self.finish(exec, ExecutionStatus::Completed, None).await;
                }
                exec.cursor = ExecutionCursor::Transition {
                    from_step_id: step.id.clone(),
                };
            }
            Visit::Outcome(StepOutcome::Waiting { reason, wakes }) => {
                let armed: Vec<ScheduledWake> = wakes
                    .iter()
                    .map(|(kind, due_at)| ScheduledWake::new(exec.id, &step.id, *kind, *due_at))
                    .collect();
                if let Some(record) = exec.last_step_execution_mut(&step.id) {
                    record.armed_wakes = armed.clone();
                }
                exec.cursor = ExecutionCursor::Waiting {
                    step_id: step.id.clone(),
                    reason,
                };
                // The waiting record goes to storage before its wake rows;
                // `recover` re-arms rows lost in between.
                self.save(exec).await?;
                self.checkpoint.arm_wakes(&armed).await?;

                let assigned_to = exec
                    .last_step_execution(&step.id)
                    .and_then(|r| r.assigned_to.clone());
                info!(
                    execution_id = %exec.id,
                    step_id = %step.id,
                    reason = ?reason,
                    assigned_to = ?assigned_to,
                    "step waiting"
                );
                self.event_bus.publish(EngineEvent::StepWaiting {
                    execution_id: exec.id,
                    step_id: step.id.clone(),
                    assigned_to,
                });
                return Ok(());
            }
            Visit::Outcome(StepOutcome::Failed(err)) => {
                let attempts = exec
                    .last_step_execution(&step.id)
                    .map(|r| r.attempts)
                    .unwrap_or(0);
                self.event_bus.publish(EngineEvent::StepFailed {
                    execution_id: exec.id,
                    step_id: step.id.clone(),
                    error: err.to_string(),
                    attempts,
                });
                if !step.continue_on_error {
                    let mut failure = ExecutionFailure::new(err.code(), err.to_string())
                        .at_step(&step.id)
                        .with_attempts(attempts);
                    if let Some(action_id) = err.action_id() {
                        failure = failure.with_action(action_id);
                    }
                    return self.fail(exec, failure).await;
                }
                warn!(
                    execution_id = %exec.id,
                    step_id = %step.id,
                    error = %err,
                    "non-critical step failed, continuing"
                );
                exec.cursor = ExecutionCursor::Transition {
                    from_step_id: step.id.clone(),
                };
            }
            Visit::Outcome(StepOutcome::TimedOut { message }) | Visit::TimedOut(message) => {
                let failure = ExecutionFailure::new(ErrorCode::Timeout, message).at_step(&step.id);
                return self.finish(exec, ExecutionStatus::Timeout, Some(failure)).await;
            }
            Visit::Skipped => {
                exec.cursor = ExecutionCursor::Transition {
                    from_step_id: step.id.clone(),
                };
            }
            Visit::Jump(target) => {
                if def.step(&target).is_none() {
                    let failure = ExecutionFailure::new(
                        ErrorCode::StepNotFound,
                        format!("timeout target step '{target}' not found"),
                    )
                    .at_step(&step.id);
                    return self.fail(exec, failure).await;
                }
                exec.authorized_revisit = Some(target.clone());
                exec.cursor = ExecutionCursor::Step { step_id: target };
            }
        }
        self.save(exec).await
    }

    async fn join_parallel(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        gateway: &WorkflowStep,
        config: &ParallelConfig,
    ) -> Result<(), EngineError> {
        let budget = self.max_steps(def).saturating_sub(exec.steps_executed);
        let token = self
            .cancellation_tokens
            .get(&exec.id)
            .map(|t| t.clone())
            .unwrap_or_default();
        let joined = self
            .parallel
            .run(def, gateway, config, exec, self.config.default_parallel_quorum, budget, &token)
            .await;
        match joined {
            Err(ParallelError::Cancelled) => self.cancel_now(exec).await,
            Err(ParallelError::Condition(e)) => {
                let failure = ExecutionFailure::new(ErrorCode::ConditionFailed, e.to_string()).at_step(&gateway.id);
                self.fail(exec, failure).await
            }
            Ok(join) if join.is_satisfied() => {
                exec.cursor = ExecutionCursor::Step {
                    step_id: config.join_step_id.clone(),
                };
                self.save(exec).await
            }
            Ok(join) => {
                let failure = ExecutionFailure::new(
                    ErrorCode::ParallelJoinFailed,
                    format!(
                        "{} of {} branches completed, {} required",
                        join.completed(),
                        join.branches.len(),
                        join.required
                    ),
                )
                .at_step(&gateway.id);
                self.fail(exec, failure).await
            }
        }
    }

    /// Resolve the transition out of a finished step.
    async fn advance(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        from_step_id: &str,
    ) -> Result<(), EngineError> {
        let source_failed = exec
            .last_step_execution(from_step_id)
            .is_some_and(|r| r.status == StepExecutionStatus::Failed);

        let resolved = self
            .transitions
            .resolve(def, from_step_id, source_failed, &mut exec.context, exec.id)
            .await;
        let resolution = match resolved {
            Ok(r) => r,
            Err(e) => {
                let failure = ExecutionFailure::new(ErrorCode::ConditionFailed, e.to_string()).at_step(from_step_id);
                return self.fail(exec, failure).await;
            }
        };

        if let Some(record) = exec.last_step_execution_mut(from_step_id) {
            record.action_executions.extend(resolution.action_executions);
        }
        if let Some((action_id, message)) = resolution.failure {
            let failure = ExecutionFailure::new(
                ErrorCode::ActionFailed,
                format!("transition action '{action_id}' failed: {message}"),
            )
            .at_step(from_step_id)
            .with_action(action_id);
            return self.fail(exec, failure).await;
        }

        match resolution.transition {
            Some(transition) => {
                exec.cursor = ExecutionCursor::Step {
                    step_id: transition.to_step_id,
                };
            }
            None => {
                let policy = def
                    .configuration
                    .dead_end_policy
                    .unwrap_or(self.config.dead_end_policy);
                match policy {
                    DeadEndPolicy::Fail => {
                        let failure = ExecutionFailure::new(
                            ErrorCode::NoValidTransition,
                            format!("no transition out of '{from_step_id}' matched"),
                        )
                        .at_step(from_step_id);
                        return self.fail(exec, failure).await;
                    }
                    DeadEndPolicy::Complete => {
                        info!(execution_id = %exec.id, step_id = from_step_id, "dead end treated as completion");
                        return self.finish(exec, ExecutionStatus::Completed, None).await;
                    }
                }
            }
        }
        self.save(exec).await
    }

    // -----------------------------------------------------------------------
    // Waiting steps
    // -----------------------------------------------------------------------

    /// Complete the parked step with `output` and move the cursor on.
    async fn complete_waiting(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        step: &WorkflowStep,
        output: Value,
    ) -> Result<(), EngineError> {
        let Some(index) = exec.step_executions.iter().rposition(|r| r.step_id == step.id) else {
            return Err(EngineError::InvalidState(format!(
                "no record of waiting step '{}'",
                step.id
            )));
        };

        let mut record = exec.step_executions[index].clone();
        record.armed_wakes.clear();
        let mut ctx = exec.context.clone();
        let outcome = self.steps.complete(step, &mut record, &mut ctx, output).await;
        exec.context = ctx;
        exec.step_executions[index] = record;
        self.settle(def, exec, step, Visit::Outcome(outcome)).await?;
        if exec.waiting_step() != Some(step.id.as_str()) {
            self.checkpoint.clear_wakes(exec.id, &step.id).await?;
        }
        Ok(())
    }

    async fn fire_wake(
        &self,
        execution_id: Uuid,
        step_id: &str,
        kind: WakeKind,
        wake_id: Uuid,
        due_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let lock = self.lock_for(execution_id);
        let _guard = lock.lock().await;

        let Some(mut exec) = self.checkpoint.load(&execution_id).await? else {
            self.checkpoint.consume_wake(&wake_id).await?;
            return Ok(false);
        };
        if exec.status == ExecutionStatus::Suspended {
            debug!(execution_id = %execution_id, step_id, "execution suspended, wake deferred");
            return Ok(false);
        }
        if exec.status.is_terminal() || exec.waiting_step() != Some(step_id) {
            self.checkpoint.consume_wake(&wake_id).await?;
            return Ok(false);
        }
        // The wake row is deleted only after the record reflecting its
        // effect is saved. A failure in between leaves the wake to fire again.
        if let Some(record) = exec.last_step_execution_mut(step_id) {
            record.armed_wakes.retain(|w| w.id != wake_id);
        }

        let def = self.definition_for(&exec).await?;
        let Some(step) = def.step(step_id).cloned() else {
            let failure = ExecutionFailure::new(ErrorCode::StepNotFound, format!("step '{step_id}' not found"))
                .at_step(step_id);
            self.fail(&mut exec, failure).await?;
            self.checkpoint.consume_wake(&wake_id).await?;
            return Ok(true);
        };

        info!(execution_id = %execution_id, step_id, kind = kind.as_str(), "wake fired");
        let resume = match kind {
            WakeKind::Timer => {
                let output = json!({ "fired_at": self.now(), "due_at": due_at });
                self.complete_waiting(&def, &mut exec, &step, output).await?;
                true
            }
            WakeKind::Escalation => {
                self.escalate(&mut exec, &step).await?;
                false
            }
            WakeKind::Timeout => self.waiting_timeout(&def, &mut exec, &step).await?,
        };
        self.checkpoint.consume_wake(&wake_id).await?;
        if resume {
            self.drive(&def, &mut exec).await?;
        }
        self.release(&exec);
        Ok(true)
    }

    /// Reassign a waiting user task and notify the escalation handler.
    async fn escalate(&self, exec: &mut WorkflowExecution, step: &WorkflowStep) -> Result<(), EngineError> {
        let policy = step.configuration.escalation.as_ref();
        let Some(record) = exec.last_step_execution_mut(&step.id) else {
            return Ok(());
        };
        let previous = record.assigned_to.clone();
        if let Some(target) = policy.and_then(|p| p.escalate_to.clone()) {
            record.assigned_to = Some(target);
        }
        record.escalated = true;
        let escalated_to = record.assigned_to.clone();
        let input = record.input_data.clone();

        warn!(
            execution_id = %exec.id,
            step_id = %step.id,
            from = ?previous,
            to = ?escalated_to,
            "user task escalated"
        );
        self.event_bus.publish(EngineEvent::StepEscalated {
            execution_id: exec.id,
            step_id: step.id.clone(),
            escalated_to: escalated_to.clone(),
        });

        if policy.is_some_and(|p| p.notify) {
            if let Some(handler) = self.capabilities.handlers.get(tags::ESCALATION) {
                let request = HandlerRequest {
                    handler: tags::ESCALATION.to_string(),
                    parameters: json!({
                        "step_id": step.id,
                        "previous_assignee": previous,
                        "escalated_to": escalated_to,
                    }),
                    input,
                    execution_id: exec.id,
                    step_id: step.id.clone(),
                    action_id: None,
                    attempt: 1,
                };
                if let Err(e) = handler.invoke(&request).await {
                    warn!(execution_id = %exec.id, step_id = %step.id, error = %e, "escalation handler failed");
                }
            }
        }
        self.save(exec).await
    }

    /// Apply the timeout policy of a waiting step. Returns whether the run
    /// loop should continue.
    async fn waiting_timeout(
        &self,
        def: &WorkflowDefinition,
        exec: &mut WorkflowExecution,
        step: &WorkflowStep,
    ) -> Result<bool, EngineError> {
        let Some(policy) = step.timeout.clone() else {
            self.save(exec).await?;
            return Ok(false);
        };
        warn!(
            execution_id = %exec.id,
            step_id = %step.id,
            action = ?policy.action,
            "waiting step timed out"
        );

        match policy.action {
            TimeoutAction::Complete => {
                self.complete_waiting(def, exec, step, json!({ "timed_out": true }))
                    .await?;
                Ok(true)
            }
            TimeoutAction::Escalate => {
                self.escalate(exec, step).await?;
                Ok(false)
            }
            TimeoutAction::Retry => {
                let max_attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
                let attempts = exec
                    .last_step_execution(&step.id)
                    .map(|r| r.attempts.max(1))
                    .unwrap_or(1);
                if attempts >= max_attempts {
                    self.time_out_waiting(exec, step).await?;
                    return Ok(false);
                }
                let wake = ScheduledWake::new(
                    exec.id,
                    &step.id,
                    WakeKind::Timeout,
                    self.now() + secs(policy.duration_secs),
                );
                if let Some(record) = exec.last_step_execution_mut(&step.id) {
                    record.attempts = attempts + 1;
                    record.armed_wakes.push(wake.clone());
                }
                self.save(exec).await?;
                self.checkpoint.arm_wakes(&[wake]).await?;
                Ok(false)
            }
            TimeoutAction::Skip => {
                let now = self.now();
                if let Some(record) = exec.last_step_execution_mut(&step.id) {
                    record.status = StepExecutionStatus::Skipped;
                    record.completed_at = Some(now);
                    record.armed_wakes.clear();
                }
                exec.cursor = ExecutionCursor::Transition {
                    from_step_id: step.id.clone(),
                };
                self.save(exec).await?;
                self.checkpoint.clear_wakes(exec.id, &step.id).await?;
                Ok(true)
            }
            TimeoutAction::GoToStep => {
                let target = policy
                    .target_step_id
                    .clone()
                    .filter(|t| def.step(t).is_some());
                let Some(target) = target else {
                    let failure = ExecutionFailure::new(
                        ErrorCode::StepNotFound,
                        format!("timeout target of step '{}' not found", step.id),
                    )
                    .at_step(&step.id);
                    self.fail(exec, failure).await?;
                    return Ok(false);
                };
                let now = self.now();
                if let Some(record) = exec.last_step_execution_mut(&step.id) {
                    mark_timed_out(record, "timed out, jumping to target", now);
                    record.armed_wakes.clear();
                }
                exec.authorized_revisit = Some(target.clone());
                exec.cursor = ExecutionCursor::Step { step_id: target };
                self.save(exec).await?;
                self.checkpoint.clear_wakes(exec.id, &step.id).await?;
                Ok(true)
            }
            TimeoutAction::Cancel => {
                self.time_out_waiting(exec, step).await?;
                Ok(false)
            }
        }
    }

    async fn time_out_waiting(&self, exec: &mut WorkflowExecution, step: &WorkflowStep) -> Result<(), EngineError> {
        let limit = step.timeout.as_ref().map(|t| t.duration_secs).unwrap_or(0);
        let message = format!("step '{}' timed out after {limit}s", step.id);
        let now = self.now();
        if let Some(record) = exec.last_step_execution_mut(&step.id) {
            mark_timed_out(record, &message, now);
        }
        let failure = ExecutionFailure::new(ErrorCode::Timeout, message).at_step(&step.id);
        self.finish(exec, ExecutionStatus::Timeout, Some(failure)).await
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn time_out_execution(&self, exec: &mut WorkflowExecution, limit: u64) -> Result<(), EngineError> {
        let message = format!("execution exceeded its {limit}s budget");
        let now = self.now();
        let mut failure = ExecutionFailure::new(ErrorCode::Timeout, message.clone());
        if let Some(record) = exec.step_executions.last_mut() {
            if record.status == StepExecutionStatus::Running {
                mark_timed_out(record, &message, now);
                failure = failure.at_step(record.step_id.clone());
            }
        }
        self.finish(exec, ExecutionStatus::Timeout, Some(failure)).await
    }

    async fn fail(&self, exec: &mut WorkflowExecution, failure: ExecutionFailure) -> Result<(), EngineError> {
        self.finish(exec, ExecutionStatus::Failed, Some(failure)).await
    }

    async fn cancel_now(&self, exec: &mut WorkflowExecution) -> Result<(), EngineError> {
        let now = self.now();
        if let Some(record) = exec.step_executions.last_mut() {
            if !record.is_finished() {
                record.status = StepExecutionStatus::Failed;
                record.error_code = Some(ErrorCode::Cancelled);
                record.error_message = Some("execution cancelled".to_string());
                record.completed_at = Some(now);
            }
        }
        let failure = ExecutionFailure::new(ErrorCode::Cancelled, "execution cancelled");
        self.finish(exec, ExecutionStatus::Cancelled, Some(failure)).await
    }

    async fn suspend_now(&self, exec: &mut WorkflowExecution) -> Result<(), EngineError> {
        exec.status = ExecutionStatus::Suspended;
        info!(execution_id = %exec.id, cursor = ?exec.cursor, "execution suspended");
        self.event_bus
            .publish(EngineEvent::ExecutionSuspended { execution_id: exec.id });
        self.save(exec).await
    }

    async fn finish(
        &self,
        exec: &mut WorkflowExecution,
        status: ExecutionStatus,
        failure: Option<ExecutionFailure>,
    ) -> Result<(), EngineError> {
        let waiting = exec.waiting_step().map(str::to_string);
        if let Some(record) = waiting.as_deref().and_then(|id| exec.last_step_execution_mut(id)) {
            record.armed_wakes.clear();
        }

        let now = self.now();
        exec.status = status;
        exec.cursor = ExecutionCursor::Finished;
        exec.completed_at = Some(now);
        if let Some(failure) = failure {
            exec.fail(failure);
        }
        exec.metrics = compute_metrics(exec, now);

        match status {
            ExecutionStatus::Completed => {
                info!(
                    execution_id = %exec.id,
                    duration_ms = exec.metrics.total_duration_ms,
                    steps_completed = exec.metrics.steps_completed,
                    "execution completed"
                );
                self.event_bus.publish(EngineEvent::ExecutionCompleted {
                    execution_id: exec.id,
                    duration_ms: exec.metrics.total_duration_ms,
                });
            }
            ExecutionStatus::Cancelled => {
                info!(execution_id = %exec.id, "execution cancelled");
                self.event_bus
                    .publish(EngineEvent::ExecutionCancelled { execution_id: exec.id });
            }
            _ => {
                let (code, error) = exec
                    .failure
                    .as_ref()
                    .map(|f| (f.code, f.message.clone()))
                    .unwrap_or((ErrorCode::InvalidState, String::new()));
                warn!(
                    execution_id = %exec.id,
                    status = %status,
                    code = %code,
                    error = %error,
                    "execution failed"
                );
                self.event_bus.publish(EngineEvent::ExecutionFailed {
                    execution_id: exec.id,
                    code,
                    error,
                });
            }
        }
        self.save(exec).await?;
        if let Some(step_id) = waiting {
            self.checkpoint.clear_wakes(exec.id, &step_id).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_live(exec: &WorkflowExecution) -> Result<(), EngineError> {
    if exec.status.is_terminal() || exec.status == ExecutionStatus::Suspended {
        return Err(EngineError::InvalidState(format!("execution is {}", exec.status)));
    }
    Ok(())
}

fn replace_last(exec: &mut WorkflowExecution, record: WorkflowStepExecution) {
    match exec.step_executions.last_mut() {
        Some(last) => *last = record,
        None => exec.step_executions.push(record),
    }
}

fn mark_timed_out(record: &mut WorkflowStepExecution, message: &str, now: DateTime<Utc>) {
    record.status = StepExecutionStatus::Timeout;
    record.error_code = Some(ErrorCode::Timeout);
    record.error_message = Some(message.to_string());
    record.completed_at = Some(now);
}

/// Drop the record of a visit interrupted by a crash so the step re-runs.
fn discard_interrupted(exec: &mut WorkflowExecution, step: &WorkflowStep) {
    let interrupted = exec
        .step_executions
        .last()
        .is_some_and(|r| r.step_id == step.id && r.status == StepExecutionStatus::Running);
    if !interrupted {
        return;
    }
    exec.step_executions.pop();
    exec.steps_executed = exec.steps_executed.saturating_sub(1);
    if let Some(n) = exec.loop_iterations.get_mut(&step.id) {
        *n = n.saturating_sub(1);
    }
    warn!(execution_id = %exec.id, step_id = %step.id, "re-executing step interrupted by a restart");
}

/// A non-loop step may be visited again only when a loop step ran since its
/// previous visit or a `go_to_step` timeout targeted it.
fn revisit_allowed(exec: &WorkflowExecution, step: &WorkflowStep) -> bool {
    if step.step_type == StepType::Loop {
        return true;
    }
    let Some(last) = exec.step_executions.iter().rposition(|r| r.step_id == step.id) else {
        return true;
    };
    exec.authorized_revisit.as_deref() == Some(step.id.as_str())
        || exec.step_executions[last + 1..]
            .iter()
            .any(|r| r.step_type == StepType::Loop)
}

/// Aggregate counters from the audit trail.
pub fn compute_metrics(exec: &WorkflowExecution, now: DateTime<Utc>) -> ExecutionMetrics {
    let started = exec.started_at.unwrap_or(exec.created_at);
    let ended = exec.completed_at.unwrap_or(now);
    let mut metrics = ExecutionMetrics {
        total_duration_ms: (ended - started).num_milliseconds().max(0) as u64,
        ..ExecutionMetrics::default()
    };

    for step in &exec.step_executions {
        match step.status {
            StepExecutionStatus::Completed => metrics.steps_completed += 1,
            StepExecutionStatus::Failed | StepExecutionStatus::Timeout => metrics.steps_failed += 1,
            StepExecutionStatus::Skipped => metrics.steps_skipped += 1,
            _ => {}
        }
        metrics.retries += step.attempts.saturating_sub(1);

        for action in &step.action_executions {
            if action.skipped {
                metrics.actions_skipped += 1;
                continue;
            }
            metrics.actions_executed += 1;
            if action.status == ActionExecutionStatus::Failed {
                metrics.actions_failed += 1;
            }
            metrics.retries += action.attempts.saturating_sub(1);
        }
    }
    metrics
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::repository::memory::InMemoryRepository;
    use crate::workflow::capability::{HandlerError, handler_fn};
    use crate::workflow::clock::ManualClock;
    use stepwise_types::action::WorkflowAction;
    use stepwise_types::condition::{ConditionOperator, WorkflowCondition};
    use stepwise_types::definition::{
        AssignmentPolicy, AssignmentType, BackoffStrategy, EscalationPolicy, LoopConfig, RetryPolicy,
        TimeoutPolicy, TransitionType, WorkflowTransition, WorkflowVariable,
    };

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn definition(steps: Vec<WorkflowStep>, transitions: Vec<WorkflowTransition>) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "name": "test-flow",
            "tenant_id": "acme",
            "status": "active",
            "steps": steps,
            "transitions": transitions,
        }))
        .unwrap()
    }

    fn engine(repo: InMemoryRepository) -> WorkflowEngine<InMemoryRepository> {
        WorkflowEngine::new(repo, EngineConfig::default())
    }

    fn service(id: &str, handler: &str) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, StepType::ServiceTask);
        step.configuration.handler = Some(handler.into());
        step
    }

    fn approval(id: &str) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, StepType::UserTask);
        step.configuration.assignment = Some(AssignmentPolicy::direct(AssignmentType::Role, "role:Approver"));
        step
    }

    fn approval_flow(approve: WorkflowStep) -> WorkflowDefinition {
        definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                approve,
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "approve"),
                WorkflowTransition::new("t2", "approve", "end"),
            ],
        )
    }

    fn counting(calls: Arc<AtomicU32>, fail: bool) -> Arc<dyn StepHandler> {
        handler_fn(move |_req: HandlerRequest| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if fail {
                    Err(HandlerError::new("downstream unavailable"))
                } else {
                    Ok(json!({ "count": n }))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_user_task_waits_then_signal_completes() {
        let repo = InMemoryRepository::new();
        let engine = engine(repo.clone());
        let def = approval_flow(approval("approve"));

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        let waiting = exec.last_step_execution("approve").unwrap();
        assert_eq!(waiting.status, StepExecutionStatus::Waiting);
        assert_eq!(waiting.assigned_to.as_deref(), Some("role:Approver"));
        assert_eq!(exec.waiting_step(), Some("approve"));

        let stored = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(stored.waiting_step(), Some("approve"));

        let done = engine
            .signal(exec.id, "approve", json!({ "approved": true }))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.context.lookup("steps.approve.output.approved"), Some(json!(true)));
        assert_eq!(done.last_step_execution("approve").unwrap().status, StepExecutionStatus::Completed);
        assert_eq!(done.metrics.steps_completed, 3);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_decision_routes_by_amount() {
        let repo = InMemoryRepository::new();
        let engine = engine(repo);
        let def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("route", StepType::Decision),
                WorkflowStep::new("large", StepType::End),
                WorkflowStep::new("small", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "route"),
                WorkflowTransition::new("big", "route", "large").when(WorkflowCondition::compare(
                    "amount",
                    ConditionOperator::GreaterThan,
                    json!(1000),
                )),
                WorkflowTransition::new("other", "route", "small"),
            ],
        );

        let big = engine
            .execute(&def, ExecutionContext::new().with_variable("amount", json!(1500)))
            .await
            .unwrap();
        assert_eq!(big.status, ExecutionStatus::Completed);
        assert_eq!(big.step_executions.last().unwrap().step_id, "large");

        let small = engine
            .execute(&def, ExecutionContext::new().with_variable("amount", json!(500)))
            .await
            .unwrap();
        assert_eq!(small.step_executions.last().unwrap().step_id, "small");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_execution() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(InMemoryRepository::new()).with_handler("charge", counting(calls.clone(), true));
        let mut pay = service("pay", "charge");
        pay.retry = Some(RetryPolicy::new(2, 0, BackoffStrategy::Fixed));
        let def = definition(
            vec![WorkflowStep::new("start", StepType::Start), pay, WorkflowStep::new("end", StepType::End)],
            vec![
                WorkflowTransition::new("t1", "start", "pay"),
                WorkflowTransition::new("t2", "pay", "end"),
            ],
        );

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let failure = exec.failure.as_ref().unwrap();
        assert_eq!(failure.code, ErrorCode::HandlerExecutionFailed);
        assert_eq!(failure.step_id.as_deref(), Some("pay"));
        assert_eq!(failure.attempts, 2);
        assert_eq!(exec.last_step_execution("pay").unwrap().status, StepExecutionStatus::Failed);
        assert_eq!(exec.metrics.retries, 1);
        assert_eq!(exec.metrics.steps_failed, 1);
    }

    #[tokio::test]
    async fn test_dead_end_fails_or_completes_per_policy() {
        let mut def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("check", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "check"),
                WorkflowTransition::new("t2", "check", "end").when(WorkflowCondition::compare(
                    "ok",
                    ConditionOperator::Equals,
                    json!(true),
                )),
            ],
        );
        let ctx = || ExecutionContext::new().with_variable("ok", json!(false));
        let engine = engine(InMemoryRepository::new());

        let exec = engine.execute(&def, ctx()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failure.as_ref().unwrap().code, ErrorCode::NoValidTransition);
        assert_eq!(exec.failure.as_ref().unwrap().step_id.as_deref(), Some("check"));

        def.configuration.dead_end_policy = Some(DeadEndPolicy::Complete);
        let exec = engine.execute(&def, ctx()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_preflight_errors() {
        let engine = engine(InMemoryRepository::new());
        let mut def = approval_flow(approval("approve"));
        def.status = stepwise_types::definition::DefinitionStatus::Draft;
        assert!(matches!(
            engine.execute(&def, ExecutionContext::new()).await,
            Err(EngineError::InvalidState(_))
        ));

        let mut def = approval_flow(approval("approve"));
        def.steps[0].is_start_step = false;
        assert!(matches!(
            engine.execute(&def, ExecutionContext::new()).await,
            Err(EngineError::NoStartStep(_))
        ));

        let mut def = approval_flow(approval("approve"));
        def.variables = vec![
            WorkflowVariable {
                name: "region".into(),
                variable_type: Default::default(),
                default_value: Some(json!("eu")),
                required: true,
                description: None,
            },
            WorkflowVariable {
                name: "amount".into(),
                variable_type: Default::default(),
                default_value: None,
                required: true,
                description: None,
            },
        ];
        let err = engine.execute(&def, ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingVariable(ref v) if v == "amount"));
        assert_eq!(err.code(), Some(ErrorCode::MissingVariable));

        let exec = engine
            .execute(&def, ExecutionContext::new().with_variable("amount", json!(3)))
            .await
            .unwrap();
        assert_eq!(exec.context.get_variable("region"), Some(&json!("eu")));
        assert_eq!(exec.context.workflow_name, "test-flow");
        assert_eq!(exec.context.execution_id, exec.id);
    }

    #[tokio::test]
    async fn test_set_variable_visible_to_next_transition() {
        let engine = engine(InMemoryRepository::new());
        let mut mark = WorkflowStep::new("mark", StepType::Task);
        mark.actions = vec![WorkflowAction::set_variable("flag", "priority", json!("high"))];
        let def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                mark,
                WorkflowStep::new("fast", StepType::End),
                WorkflowStep::new("slow", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "mark"),
                WorkflowTransition::new("to_fast", "mark", "fast").when(WorkflowCondition::compare(
                    "priority",
                    ConditionOperator::Equals,
                    json!("high"),
                )),
                WorkflowTransition::new("to_slow", "mark", "slow"),
            ],
        );

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.step_executions.last().unwrap().step_id, "fast");
        assert_eq!(exec.metrics.actions_executed, 1);
    }

    fn loop_flow(max_iterations: u32) -> WorkflowDefinition {
        let mut work = service("work", "work");
        work.configuration.output_mapping.insert("count".into(), "count".into());
        let mut again = WorkflowStep::new("again", StepType::Loop);
        again.configuration.loop_config = Some(LoopConfig {
            condition: Some(WorkflowCondition::compare("count", ConditionOperator::LessThan, json!(3))),
            max_iterations,
        });
        definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                work,
                again,
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "work"),
                WorkflowTransition::new("t2", "work", "again"),
                WorkflowTransition::new("repeat", "again", "work").when(WorkflowCondition::compare(
                    "steps.again.output.continue",
                    ConditionOperator::Equals,
                    json!(true),
                )),
                WorkflowTransition::new("exit", "again", "end"),
            ],
        )
    }

    #[tokio::test]
    async fn test_loop_repeats_until_condition_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(InMemoryRepository::new()).with_handler("work", counting(calls.clone(), false));

        let exec = engine.execute(&loop_flow(10), ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.context.get_variable("count"), Some(&json!(3)));
        assert!(exec.loop_iterations.is_empty());
    }

    #[tokio::test]
    async fn test_max_steps_guard() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(InMemoryRepository::new()).with_handler("work", counting(calls, false));
        let mut def = loop_flow(10);
        def.configuration.max_steps = Some(4);

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Aborted);
        assert!(exec.status.is_terminal());
        assert_eq!(exec.failure.as_ref().unwrap().code, ErrorCode::MaxStepsExceeded);
        assert_eq!(exec.steps_executed, 4);
    }

    #[tokio::test]
    async fn test_revisit_without_loop_is_illegal() {
        let engine = engine(InMemoryRepository::new());
        let def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("a", StepType::Task),
                WorkflowStep::new("b", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "a"),
                WorkflowTransition::new("t2", "a", "b"),
                WorkflowTransition::new("back", "b", "a"),
            ],
        );

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let failure = exec.failure.unwrap();
        assert_eq!(failure.code, ErrorCode::IllegalRevisit);
        assert_eq!(failure.step_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_timer_task_fires_on_due_wake() {
        let repo = InMemoryRepository::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(repo.clone()).with_clock(clock.clone());
        let mut wait = WorkflowStep::new("cool_off", StepType::TimerTask);
        wait.configuration.parameters.insert("duration_secs".into(), json!(60));
        let def = approval_flow(wait);
        let def = WorkflowDefinition {
            transitions: vec![
                WorkflowTransition::new("t1", "start", "cool_off"),
                WorkflowTransition::new("t2", "cool_off", "end"),
            ],
            ..def
        };

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.waiting_step(), Some("cool_off"));
        assert_eq!(repo.wake_count(), 1);
        assert!(matches!(
            engine.signal(exec.id, "cool_off", json!({})).await,
            Err(EngineError::StepNotWaiting { .. })
        ));

        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 1);

        let done = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(repo.wake_count(), 0);
    }

    #[tokio::test]
    async fn test_escalation_reassigns_and_notifies() {
        let repo = InMemoryRepository::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let notified = Arc::new(AtomicU32::new(0));
        let engine = engine(repo.clone())
            .with_clock(clock.clone())
            .with_handler(tags::ESCALATION, counting(notified.clone(), false));
        let mut approve = approval("approve");
        approve.configuration.escalation = Some(EscalationPolicy {
            after_secs: 3600,
            escalate_to: Some("role:Manager".into()),
            notify: true,
        });
        let def = approval_flow(approve);
        let mut events = engine.event_bus().subscribe();

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 1);

        let exec = engine.get_execution(exec.id).await.unwrap();
        let record = exec.last_step_execution("approve").unwrap();
        assert!(record.escalated);
        assert_eq!(record.assigned_to.as_deref(), Some("role:Manager"));
        assert_eq!(exec.waiting_step(), Some("approve"));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let mut saw_escalation = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::StepEscalated { ref escalated_to, .. } if escalated_to.as_deref() == Some("role:Manager")) {
                saw_escalation = true;
            }
        }
        assert!(saw_escalation);
    }

    #[tokio::test]
    async fn test_waiting_timeout_cancel_times_out_execution() {
        let repo = InMemoryRepository::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(repo.clone()).with_clock(clock.clone());
        let mut approve = approval("approve");
        approve.timeout = Some(TimeoutPolicy {
            duration_secs: 600,
            action: TimeoutAction::Cancel,
            target_step_id: None,
        });
        let exec = engine.execute(&approval_flow(approve), ExecutionContext::new()).await.unwrap();

        clock.advance(chrono::Duration::minutes(11));
        engine.process_due_wakes(clock.now()).await.unwrap();
        let exec = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert_eq!(exec.last_step_execution("approve").unwrap().status, StepExecutionStatus::Timeout);
        assert_eq!(exec.failure.unwrap().code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_waiting_timeout_complete_resumes() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = engine(InMemoryRepository::new()).with_clock(clock.clone());
        let mut approve = approval("approve");
        approve.timeout = Some(TimeoutPolicy {
            duration_secs: 60,
            action: TimeoutAction::Complete,
            target_step_id: None,
        });
        let exec = engine.execute(&approval_flow(approve), ExecutionContext::new()).await.unwrap();

        clock.advance(chrono::Duration::minutes(2));
        engine.process_due_wakes(clock.now()).await.unwrap();
        let exec = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.context.lookup("steps.approve.output.timed_out"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_execution_clears_wakes() {
        let repo = InMemoryRepository::new();
        let engine = engine(repo.clone());
        let mut approve = approval("approve");
        approve.timeout = Some(TimeoutPolicy {
            duration_secs: 86_400,
            action: TimeoutAction::Cancel,
            target_step_id: None,
        });
        let exec = engine.execute(&approval_flow(approve), ExecutionContext::new()).await.unwrap();
        assert_eq!(repo.wake_count(), 1);

        let cancelled = engine.cancel(exec.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(repo.wake_count(), 0);
        assert_eq!(
            cancelled.last_step_execution("approve").unwrap().error_code,
            Some(ErrorCode::Cancelled)
        );
        assert!(matches!(
            engine.signal(exec.id, "approve", json!({})).await,
            Err(EngineError::InvalidState(_))
        ));
        assert!(engine.cancel(exec.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let engine = engine(InMemoryRepository::new());
        let exec = engine
            .execute(&approval_flow(approval("approve")), ExecutionContext::new())
            .await
            .unwrap();

        let suspended = engine.suspend(exec.id).await.unwrap();
        assert_eq!(suspended.status, ExecutionStatus::Suspended);
        assert!(matches!(
            engine.signal(exec.id, "approve", json!({})).await,
            Err(EngineError::InvalidState(_))
        ));

        let resumed = engine.resume(exec.id).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert!(matches!(engine.resume(exec.id).await, Err(EngineError::InvalidState(_))));

        let done = engine.signal(exec.id, "approve", json!({ "ok": true })).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_gateway_joins_before_continuing() {
        let engine = engine(InMemoryRepository::new())
            .with_handler("a", handler_fn(|_r: HandlerRequest| async move { Ok(json!({ "a": 1 })) }))
            .with_handler("b", handler_fn(|_r: HandlerRequest| async move { Ok(json!({ "b": 2 })) }));
        let mut fork = WorkflowStep::new("fork", StepType::Parallel);
        fork.configuration.parallel = Some(ParallelConfig {
            join_step_id: "join".into(),
            quorum: None,
        });
        let mut a = service("branch_a", "a");
        a.configuration.output_mapping.insert("a".into(), "a".into());
        let mut b = service("branch_b", "b");
        b.configuration.output_mapping.insert("b".into(), "b".into());
        let mut def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                fork,
                a,
                b,
                WorkflowStep::new("join", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "fork"),
                WorkflowTransition::new("fa", "fork", "branch_a"),
                WorkflowTransition::new("fb", "fork", "branch_b"),
                WorkflowTransition::new("ja", "branch_a", "join"),
                WorkflowTransition::new("jb", "branch_b", "join"),
                WorkflowTransition::new("t2", "join", "end"),
            ],
        );
        def.configuration.parallel_execution_enabled = true;

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.joins.len(), 1);
        assert!(exec.joins[0].is_satisfied());
        let join_input = &exec.last_step_execution("join").unwrap().input_data;
        assert_eq!(join_input["a"], json!(1));
        assert_eq!(join_input["b"], json!(2));
    }

    #[tokio::test]
    async fn test_non_critical_failure_takes_exception_transition() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(InMemoryRepository::new()).with_handler("flaky", counting(calls, true));
        let mut notify = service("notify", "flaky");
        notify.continue_on_error = true;
        let mut on_error = WorkflowTransition::new("on_error", "notify", "fallback");
        on_error.transition_type = TransitionType::Exception;
        let def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                notify,
                WorkflowStep::new("fallback", StepType::End),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "notify"),
                WorkflowTransition::new("t2", "notify", "end"),
                on_error,
            ],
        );

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_executions.last().unwrap().step_id, "fallback");
        assert_eq!(exec.metrics.steps_failed, 1);
    }

    #[tokio::test]
    async fn test_sync_timeout_skip_continues() {
        let engine = engine(InMemoryRepository::new()).with_handler(
            "slow",
            handler_fn(|_r: HandlerRequest| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }),
        );
        let mut slow = service("slow", "slow");
        slow.timeout = Some(TimeoutPolicy {
            duration_secs: 0,
            action: TimeoutAction::Skip,
            target_step_id: None,
        });
        let def = approval_flow(slow);
        let def = WorkflowDefinition {
            transitions: vec![
                WorkflowTransition::new("t1", "start", "slow"),
                WorkflowTransition::new("t2", "slow", "end"),
            ],
            ..def
        };

        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.last_step_execution("slow").unwrap().status, StepExecutionStatus::Skipped);
        assert_eq!(exec.metrics.steps_skipped, 1);
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let engine = Arc::new(engine(InMemoryRepository::new()));
        let mut events = engine.event_bus().subscribe();
        let def = definition(
            vec![WorkflowStep::new("start", StepType::Start), WorkflowStep::new("end", StepType::End)],
            vec![WorkflowTransition::new("t1", "start", "end")],
        );

        let id = engine.start(&def, ExecutionContext::new()).await.unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::ExecutionCompleted { execution_id, .. }) if execution_id == id => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await;
        assert!(completed.is_ok());
        assert_eq!(engine.get_execution(id).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_recover_redrives_interrupted_execution() {
        let repo = InMemoryRepository::new();
        let engine = engine(repo.clone());
        let def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("work", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "work"),
                WorkflowTransition::new("t2", "work", "end"),
            ],
        );
        repo.save_definition(&def).await.unwrap();

        let mut exec = WorkflowExecution::new(def.id, &def.name, def.version, ExecutionContext::new(), t0());
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(t0());
        exec.cursor = ExecutionCursor::Step {
            step_id: "work".into(),
        };
        exec.steps_executed = 2;
        exec.step_executions
            .push(WorkflowStepExecution::new("work", "work", StepType::Task, t0()));
        repo.save_execution(&exec).await.unwrap();

        let recovered = engine.recover().await.unwrap();
        assert_eq!(recovered, vec![exec.id]);
        let done = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        let work_visits = done.step_executions.iter().filter(|r| r.step_id == "work").count();
        assert_eq!(work_visits, 1);
        assert_eq!(done.steps_executed, 3);
    }

    #[tokio::test]
    async fn test_register_validate_and_execute_by_id() {
        let engine = engine(InMemoryRepository::new());
        let def = approval_flow(approval("approve"));

        let report = engine.register(&def).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(engine.validate(def.id).await.unwrap(), report);

        let exec = engine.execute_by_id(def.id, ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.workflow_id, def.id);
        assert!(matches!(
            engine.execute_by_id(Uuid::now_v7(), ExecutionContext::new()).await,
            Err(EngineError::DefinitionNotFound(_))
        ));
    }

    /// In-memory store that lets `skipped_saves` execution writes through,
    /// then fails the next `failing_saves`.
    #[derive(Clone, Default)]
    struct FlakyRepository {
        inner: InMemoryRepository,
        skipped_saves: Arc<AtomicU32>,
        failing_saves: Arc<AtomicU32>,
    }

    impl FlakyRepository {
        fn fail_saves(&self, skip: u32, fail: u32) {
            self.skipped_saves.store(skip, Ordering::SeqCst);
            self.failing_saves.store(fail, Ordering::SeqCst);
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl ExecutionRepository for FlakyRepository {
        async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
            self.inner.save_definition(def).await
        }

        async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            self.inner.get_definition(id).await
        }

        async fn get_definition_version(
            &self,
            id: &Uuid,
            version: u32,
        ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            self.inner.get_definition_version(id, version).await
        }

        async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
            self.inner.list_definitions().await
        }

        async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
            if !take_one(&self.skipped_saves) && take_one(&self.failing_saves) {
                return Err(RepositoryError::Connection);
            }
            self.inner.save_execution(execution).await
        }

        async fn load_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
            self.inner.load_execution(id).await
        }

        async fn list_executions(
            &self,
            status: Option<ExecutionStatus>,
        ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
            self.inner.list_executions(status).await
        }

        async fn schedule_wake(&self, wake: &ScheduledWake) -> Result<(), RepositoryError> {
            self.inner.schedule_wake(wake).await
        }

        async fn due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, RepositoryError> {
            self.inner.due_wakes(now).await
        }

        async fn delete_wake(&self, id: &Uuid) -> Result<(), RepositoryError> {
            self.inner.delete_wake(id).await
        }

        async fn delete_wakes_for_step(&self, execution_id: &Uuid, step_id: &str) -> Result<(), RepositoryError> {
            self.inner.delete_wakes_for_step(execution_id, step_id).await
        }
    }

    fn timer_flow(duration_secs: u64) -> WorkflowDefinition {
        let mut wait = WorkflowStep::new("wait", StepType::TimerTask);
        wait.configuration
            .parameters
            .insert("duration_secs".into(), json!(duration_secs));
        definition(
            vec![WorkflowStep::new("start", StepType::Start), wait, WorkflowStep::new("end", StepType::End)],
            vec![
                WorkflowTransition::new("t1", "start", "wait"),
                WorkflowTransition::new("t2", "wait", "end"),
            ],
        )
    }

    fn service_flow(handler: &str) -> WorkflowDefinition {
        definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                service("work", handler),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "work"),
                WorkflowTransition::new("t2", "work", "end"),
            ],
        )
    }

    fn sleeper(duration: Duration) -> Arc<dyn StepHandler> {
        handler_fn(move |_req: HandlerRequest| async move {
            tokio::time::sleep(duration).await;
            Ok(json!(null))
        })
    }

    #[tokio::test]
    async fn test_timer_survives_failed_checkpoint_and_restart() {
        let repo = FlakyRepository::default();
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = WorkflowEngine::new(repo.clone(), EngineConfig::default()).with_clock(clock.clone());

        let exec = engine.execute(&timer_flow(30), ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.waiting_step(), Some("wait"));
        assert_eq!(repo.inner.wake_count(), 1);

        clock.advance(chrono::Duration::seconds(60));
        repo.fail_saves(0, 1);
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 0);
        let stored = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(stored.waiting_step(), Some("wait"));
        assert_eq!(repo.inner.wake_count(), 1);

        let restarted = WorkflowEngine::new(repo.clone(), EngineConfig::default()).with_clock(clock.clone());
        assert!(restarted.recover().await.unwrap().is_empty());
        assert_eq!(restarted.process_due_wakes(clock.now()).await.unwrap(), 1);
        let done = restarted.get_execution(exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(repo.inner.wake_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_waiting_checkpoint_arms_no_wakes() {
        let repo = FlakyRepository::default();
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = WorkflowEngine::new(repo.clone(), EngineConfig::default()).with_clock(clock.clone());
        let def = timer_flow(30);
        repo.save_definition(&def).await.unwrap();

        let mut exec = WorkflowExecution::new(def.id, &def.name, def.version, ExecutionContext::new(), t0());
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(t0());
        exec.cursor = ExecutionCursor::Step {
            step_id: "wait".into(),
        };
        repo.save_execution(&exec).await.unwrap();

        // The visit record is saved; the waiting checkpoint after it fails.
        repo.fail_saves(1, 1);
        assert!(engine.recover().await.unwrap().is_empty());
        assert_eq!(repo.inner.wake_count(), 0);
        let stored = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(stored.last_step_execution("wait").unwrap().status, StepExecutionStatus::Running);

        let recovered = engine.recover().await.unwrap();
        assert_eq!(recovered, vec![exec.id]);
        assert_eq!(repo.inner.wake_count(), 1);
        let stored = engine.get_execution(exec.id).await.unwrap();
        assert_eq!(stored.waiting_step(), Some("wait"));
        assert_eq!(stored.step_executions.len(), 1);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 1);
        assert_eq!(engine.get_execution(exec.id).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_recover_rearms_lost_wakes_without_refiring_escalation() {
        let repo = InMemoryRepository::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let notified = Arc::new(AtomicU32::new(0));
        let engine = engine(repo.clone())
            .with_clock(clock.clone())
            .with_handler(tags::ESCALATION, counting(notified.clone(), false));
        let mut approve = approval("approve");
        approve.configuration.escalation = Some(EscalationPolicy {
            after_secs: 3600,
            escalate_to: Some("role:Manager".into()),
            notify: true,
        });
        approve.timeout = Some(TimeoutPolicy {
            duration_secs: 86_400,
            action: TimeoutAction::Cancel,
            target_step_id: None,
        });
        let exec = engine.execute(&approval_flow(approve), ExecutionContext::new()).await.unwrap();
        assert_eq!(exec.last_step_execution("approve").unwrap().armed_wakes.len(), 2);
        assert_eq!(repo.wake_count(), 2);

        repo.delete_wakes_for_step(&exec.id, "approve").await.unwrap();
        assert!(engine.recover().await.unwrap().is_empty());
        assert_eq!(repo.wake_count(), 2);
        assert!(engine.recover().await.unwrap().is_empty());
        assert_eq!(repo.wake_count(), 2);

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(repo.wake_count(), 1);
        let stored = engine.get_execution(exec.id).await.unwrap();
        let record = stored.last_step_execution("approve").unwrap();
        assert_eq!(record.armed_wakes.len(), 1);
        assert_eq!(record.armed_wakes[0].kind, WakeKind::Timeout);

        engine.recover().await.unwrap();
        assert_eq!(repo.wake_count(), 1);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(engine.process_due_wakes(clock.now()).await.unwrap(), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_abandons_running_step() {
        let engine = Arc::new(engine(InMemoryRepository::new()).with_handler("slow", sleeper(Duration::from_secs(3600))));
        let mut events = engine.event_bus().subscribe();

        let id = engine.start(&service_flow("slow"), ExecutionContext::new()).await.unwrap();
        let started = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::StepStarted { execution_id, ref step_id, .. })
                        if execution_id == id && step_id == "work" =>
                    {
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await;
        assert!(started.is_ok());

        let cancelled = tokio::time::timeout(Duration::from_secs(5), engine.cancel(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.failure.as_ref().unwrap().code, ErrorCode::Cancelled);
        let work = cancelled.last_step_execution("work").unwrap();
        assert_eq!(work.status, StepExecutionStatus::Failed);
        assert_eq!(work.error_code, Some(ErrorCode::Cancelled));
        assert!(cancelled.last_step_execution("end").is_none());
    }

    #[tokio::test]
    async fn test_concurrency_limit_serializes_executions() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let handler = {
            let (active, peak) = (active.clone(), peak.clone());
            handler_fn(move |_req: HandlerRequest| {
                let (active, peak) = (active.clone(), peak.clone());
                async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
        };
        let config = EngineConfig {
            max_concurrent_executions: 1,
            ..EngineConfig::default()
        };
        let engine = Arc::new(WorkflowEngine::new(InMemoryRepository::new(), config).with_handler("work", handler));
        let mut events = engine.event_bus().subscribe();
        let def = service_flow("work");

        let first = engine.start(&def, ExecutionContext::new()).await.unwrap();
        let second = engine.start(&def, ExecutionContext::new()).await.unwrap();
        let both = tokio::time::timeout(Duration::from_secs(5), async {
            let mut completed = 0;
            while completed < 2 {
                match events.recv().await {
                    Ok(EngineEvent::ExecutionCompleted { .. }) => completed += 1,
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await;
        assert!(both.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        for id in [first, second] {
            assert_eq!(engine.get_execution(id).await.unwrap().status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_definition_timeout_ends_execution() {
        let engine = engine(InMemoryRepository::new()).with_handler("slow", sleeper(Duration::from_secs(3600)));
        let mut def = service_flow("slow");
        def.configuration.timeout_secs = Some(2);

        let started = tokio::time::Instant::now();
        let exec = engine.execute(&def, ExecutionContext::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(300));
        assert_eq!(exec.status, ExecutionStatus::Timeout);
        let failure = exec.failure.as_ref().unwrap();
        assert_eq!(failure.code, ErrorCode::Timeout);
        assert_eq!(failure.step_id.as_deref(), Some("work"));
        assert_eq!(exec.last_step_execution("work").unwrap().status, StepExecutionStatus::Timeout);
        assert_eq!(engine.get_execution(exec.id).await.unwrap().status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_during_parallel_fan_out() {
        let engine = Arc::new(
            engine(InMemoryRepository::new())
                .with_handler("fast", handler_fn(|_r: HandlerRequest| async move { Ok(json!({ "a": 1 })) }))
                .with_handler("slow", sleeper(Duration::from_secs(3600))),
        );
        let mut fork = WorkflowStep::new("fork", StepType::Parallel);
        fork.configuration.parallel = Some(ParallelConfig {
            join_step_id: "join".into(),
            quorum: None,
        });
        let mut def = definition(
            vec![
                WorkflowStep::new("start", StepType::Start),
                fork,
                service("branch_a", "fast"),
                service("branch_b", "slow"),
                WorkflowStep::new("join", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "fork"),
                WorkflowTransition::new("fa", "fork", "branch_a"),
                WorkflowTransition::new("fb", "fork", "branch_b"),
                WorkflowTransition::new("ja", "branch_a", "join"),
                WorkflowTransition::new("jb", "branch_b", "join"),
                WorkflowTransition::new("t2", "join", "end"),
            ],
        );
        def.configuration.parallel_execution_enabled = true;
        let mut events = engine.event_bus().subscribe();

        let id = engine.start(&def, ExecutionContext::new()).await.unwrap();
        let branching = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::StepStarted { ref step_id, .. }) if step_id == "branch_b" => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await;
        assert!(branching.is_ok());

        let cancelled = tokio::time::timeout(Duration::from_secs(5), engine.cancel(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.joins.is_empty());
        assert!(cancelled.last_step_execution("join").is_none());
    }
}
