//! Fan-out/join for parallel gateways.
//!
//! When a `parallel` step completes and the definition enables parallel
//! execution, every outgoing transition whose condition holds becomes a
//! branch. Branches run concurrently in a `JoinSet` on their own copy of the
//! context and stop when they reach the gateway's join step. Completed
//! branches merge their writes back in declaration order; the `JoinState`
//! decides whether the run may continue at the join step.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::context::ExecutionContext;
use stepwise_types::definition::{
    ParallelConfig, StepType, TransitionType, WorkflowDefinition, WorkflowStep, WorkflowTransition,
};
use stepwise_types::event::EngineEvent;
use stepwise_types::execution::{
    ActionOrigin, BranchState, ErrorCode, JoinState, StepExecutionStatus, WorkflowActionExecution,
    WorkflowExecution, WorkflowStepExecution,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::action::ActionScope;
use super::condition::ConditionError;
use super::step_runner::{StepExecutor, StepOutcome};
use super::transition::TransitionResolver;
use crate::event::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum ParallelError {
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// The execution was cancelled while branches were running. Unfinished
    /// branches are aborted and nothing is merged.
    #[error("parallel branches cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// ParallelRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParallelRunner {
    steps: StepExecutor,
    transitions: TransitionResolver,
    events: EventBus,
}

impl ParallelRunner {
    pub fn new(steps: StepExecutor, transitions: TransitionResolver, events: EventBus) -> Self {
        Self {
            steps,
            transitions,
            events,
        }
    }

    /// Run every branch of `gateway` to its join step.
    ///
    /// Branch step records are appended to the execution's trail, the
    /// gateway's last record receives the fan-out transition actions, and the
    /// resulting `JoinState` is pushed onto `execution.joins`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        gateway: &WorkflowStep,
        config: &ParallelConfig,
        execution: &mut WorkflowExecution,
        default_quorum: Option<u32>,
        step_budget: u32,
        token: &CancellationToken,
    ) -> Result<JoinState, ParallelError> {
        let branches = self.branches(def, &gateway.id, &execution.context)?;
        let count = branches.len() as u32;
        let required = config.quorum.or(default_quorum).unwrap_or(count).min(count);

        info!(
            execution_id = %execution.id,
            step_id = %gateway.id,
            branches = count,
            required,
            join_step_id = %config.join_step_id,
            "fanning out parallel branches"
        );

        let shared = Arc::new(def.clone());
        let mut set = JoinSet::new();
        for (index, transition) in branches.iter().enumerate() {
            let branch = Branch {
                index,
                gateway_step_id: gateway.id.clone(),
                transition: transition.clone(),
                join_step_id: config.join_step_id.clone(),
                def: Arc::clone(&shared),
                steps: self.steps.clone(),
                transitions: self.transitions.clone(),
                events: self.events.clone(),
                ctx: execution.context.clone(),
                budget: step_budget,
            };
            set.spawn(branch.run());
        }

        let mut outcomes: Vec<Option<BranchOutcome>> = (0..branches.len()).map(|_| None).collect();
        loop {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!(execution_id = %execution.id, step_id = %gateway.id, "parallel branches cancelled");
                    set.shutdown().await;
                    return Err(ParallelError::Cancelled);
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok(outcome) => {
                    let slot = outcome.index;
                    outcomes[slot] = Some(outcome);
                }
                Err(e) => warn!(execution_id = %execution.id, error = %e, "parallel branch task aborted"),
            }
        }

        let snapshot = execution.context.clone();
        let mut states = Vec::with_capacity(branches.len());
        let mut entry_actions = Vec::new();
        for (transition, outcome) in branches.iter().zip(outcomes) {
            let Some(outcome) = outcome else {
                states.push(BranchState {
                    transition_id: transition.id.clone(),
                    first_step_id: transition.to_step_id.clone(),
                    status: StepExecutionStatus::Failed,
                    error_message: Some("branch task aborted".to_string()),
                });
                continue;
            };
            if outcome.state.status == StepExecutionStatus::Completed {
                merge(&mut execution.context, &snapshot, &outcome.ctx);
            }
            execution.steps_executed = execution.steps_executed.saturating_add(outcome.steps_executed);
            execution.step_executions.extend(outcome.records);
            entry_actions.extend(outcome.entry_actions);
            states.push(outcome.state);
        }

        if let Some(record) = execution.last_step_execution_mut(&gateway.id) {
            record.action_executions.extend(entry_actions);
        }

        let join = JoinState {
            gateway_step_id: gateway.id.clone(),
            join_step_id: config.join_step_id.clone(),
            branches: states,
            required,
        };
        debug!(
            execution_id = %execution.id,
            step_id = %gateway.id,
            completed = join.completed(),
            failed = join.failed(),
            satisfied = join.is_satisfied(),
            "parallel branches joined"
        );
        execution.joins.push(join.clone());
        Ok(join)
    }

    /// Outgoing non-exception transitions whose condition holds, in
    /// evaluation order.
    fn branches(
        &self,
        def: &WorkflowDefinition,
        gateway_step_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<Vec<WorkflowTransition>, ConditionError> {
        let mut out = Vec::new();
        for t in TransitionResolver::ordered(def, gateway_step_id) {
            if t.transition_type == TransitionType::Exception {
                continue;
            }
            if self.steps.conditions().holds(t.condition.as_ref(), ctx)? {
                out.push(t.clone());
            }
        }
        Ok(out)
    }
}

/// Apply the writes a branch made relative to `snapshot`.
fn merge(target: &mut ExecutionContext, snapshot: &ExecutionContext, branch: &ExecutionContext) {
    for (name, value) in &branch.variables {
        if snapshot.variables.get(name) != Some(value) {
            target.variables.insert(name.clone(), value.clone());
        }
    }
    for (step_id, output) in &branch.step_outputs {
        if snapshot.step_outputs.get(step_id) != Some(output) {
            target.step_outputs.insert(step_id.clone(), output.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

struct Branch {
    index: usize,
    gateway_step_id: String,
    transition: WorkflowTransition,
    join_step_id: String,
    def: Arc<WorkflowDefinition>,
    steps: StepExecutor,
    transitions: TransitionResolver,
    events: EventBus,
    ctx: ExecutionContext,
    budget: u32,
}

struct BranchOutcome {
    index: usize,
    state: BranchState,
    ctx: ExecutionContext,
    records: Vec<WorkflowStepExecution>,
    entry_actions: Vec<WorkflowActionExecution>,
    steps_executed: u32,
}

impl Branch {
    async fn run(mut self) -> BranchOutcome {
        let execution_id = self.ctx.execution_id;
        let mut records = Vec::new();
        let mut steps_executed = 0u32;

        let origin = ActionOrigin::Transition {
            transition_id: self.transition.id.clone(),
        };
        let scope = ActionScope {
            execution_id,
            step_id: &self.gateway_step_id,
        };
        let (entry_actions, failure) = self
            .steps
            .actions()
            .execute_all(&self.transition.actions, &origin, &mut self.ctx, scope)
            .await;
        if let Some((action_id, message)) = failure {
            let error = format!("transition action '{action_id}' failed: {message}");
            return self.finish(StepExecutionStatus::Failed, Some(error), records, entry_actions, steps_executed);
        }

        let mut iterations: BTreeMap<String, u32> = BTreeMap::new();
        let mut current = self.transition.to_step_id.clone();
        let error = loop {
            if current == self.join_step_id {
                return self.finish(StepExecutionStatus::Completed, None, records, entry_actions, steps_executed);
            }
            if steps_executed >= self.budget {
                break format!("step budget exhausted before reaching '{}'", self.join_step_id);
            }
            let Some(step) = self.def.step(&current).cloned() else {
                break format!("step '{current}' not found");
            };

            steps_executed += 1;
            let iteration = if step.step_type == StepType::Loop {
                let n = iterations.entry(step.id.clone()).or_insert(0);
                *n += 1;
                *n
            } else {
                1
            };

            let now = self.steps.capabilities().clock.now();
            let mut record = WorkflowStepExecution::new(&step.id, step.display_name(), step.step_type, now);
            self.events.publish(EngineEvent::StepStarted {
                execution_id,
                step_id: step.id.clone(),
                step_type: step.step_type.to_string(),
            });

            let outcome = self.steps.run(&step, &mut record, &mut self.ctx, iteration).await;
            let failed = match outcome {
                StepOutcome::Completed => {
                    self.events.publish(EngineEvent::StepCompleted {
                        execution_id,
                        step_id: step.id.clone(),
                        duration_ms: record.duration_ms(),
                    });
                    false
                }
                StepOutcome::Failed(err) => {
                    self.events.publish(EngineEvent::StepFailed {
                        execution_id,
                        step_id: step.id.clone(),
                        error: err.to_string(),
                        attempts: record.attempts,
                    });
                    if !step.continue_on_error {
                        records.push(record);
                        break err.to_string();
                    }
                    true
                }
                StepOutcome::Waiting { .. } => {
                    record.status = StepExecutionStatus::Failed;
                    record.error_code = Some(ErrorCode::InvalidState);
                    record.error_message = Some("step would suspend inside a parallel branch".to_string());
                    record.completed_at = Some(self.steps.capabilities().clock.now());
                    records.push(record);
                    break format!("step '{}' would suspend inside a parallel branch", step.id);
                }
                StepOutcome::TimedOut { message } => {
                    record.status = StepExecutionStatus::Timeout;
                    record.error_code = Some(ErrorCode::Timeout);
                    record.error_message = Some(message.clone());
                    record.completed_at = Some(self.steps.capabilities().clock.now());
                    records.push(record);
                    break message;
                }
            };

            if step.step_type == StepType::Loop
                && self.ctx.lookup(&format!("steps.{}.output.continue", step.id)) == Some(Value::Bool(false))
            {
                iterations.remove(&step.id);
            }

            let resolved = self
                .transitions
                .resolve(&self.def, &step.id, failed, &mut self.ctx, execution_id)
                .await;
            let resolution = match resolved {
                Ok(r) => r,
                Err(e) => {
                    records.push(record);
                    break e.to_string();
                }
            };
            record.action_executions.extend(resolution.action_executions);
            records.push(record);

            if let Some((action_id, message)) = resolution.failure {
                break format!("transition action '{action_id}' failed: {message}");
            }
            match resolution.transition {
                Some(t) => current = t.to_step_id,
                None => break format!("dead end at step '{}'", step.id),
            }
        };

        warn!(
            execution_id = %execution_id,
            transition_id = %self.transition.id,
            error = %error,
            "parallel branch failed"
        );
        self.finish(StepExecutionStatus::Failed, Some(error), records, entry_actions, steps_executed)
    }

    fn finish(
        self,
        status: StepExecutionStatus,
        error_message: Option<String>,
        records: Vec<WorkflowStepExecution>,
        entry_actions: Vec<WorkflowActionExecution>,
        steps_executed: u32,
    ) -> BranchOutcome {
        BranchOutcome {
            index: self.index,
            state: BranchState {
                transition_id: self.transition.id,
                first_step_id: self.transition.to_step_id,
                status,
                error_message,
            },
            ctx: self.ctx,
            records,
            entry_actions,
            steps_executed,
        }
    }
}
