//! Durable checkpoint manager for execution state.
//!
//! Wraps `ExecutionRepository` with the operations the run loop needs at each
//! step boundary: persist the whole execution record, and arm or clear the
//! durable wakes of a waiting step. A crash loses at most the in-flight step.

use chrono::{DateTime, Utc};
use stepwise_types::execution::{ScheduledWake, WorkflowExecution};
use tracing::debug;
use uuid::Uuid;

use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `R: ExecutionRepository` so it works with any storage backend
/// (SQLite, in-memory, ...).
pub struct CheckpointManager<R: ExecutionRepository> {
    repo: R,
}

impl<R: ExecutionRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist the execution, stamping `updated_at`.
    pub async fn save(&self, execution: &mut WorkflowExecution, now: DateTime<Utc>) -> Result<(), CheckpointError> {
        execution.updated_at = now;
        self.repo
            .save_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        debug!(
            execution_id = %execution.id,
            status = %execution.status,
            steps_executed = execution.steps_executed,
            "checkpointed execution"
        );
        Ok(())
    }

    /// Load an execution by id.
    pub async fn load(&self, execution_id: &Uuid) -> Result<Option<WorkflowExecution>, CheckpointError> {
        self.repo
            .load_execution(execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Write wake rows. Wakes keep their ids, so re-arming a wake that is
    /// already stored is a no-op.
    pub async fn arm_wakes(&self, wakes: &[ScheduledWake]) -> Result<(), CheckpointError> {
        for wake in wakes {
            self.repo
                .schedule_wake(wake)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
            debug!(
                execution_id = %wake.execution_id,
                step_id = %wake.step_id,
                kind = wake.kind.as_str(),
                due_at = %wake.due_at,
                "armed wake"
            );
        }
        Ok(())
    }

    /// Drop every pending wake of a step.
    pub async fn clear_wakes(&self, execution_id: Uuid, step_id: &str) -> Result<(), CheckpointError> {
        self.repo
            .delete_wakes_for_step(&execution_id, step_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Drop a single fired wake.
    pub async fn consume_wake(&self, wake_id: &Uuid) -> Result<(), CheckpointError> {
        self.repo
            .delete_wake(wake_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),
}
