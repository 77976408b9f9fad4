//! Execution repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions and
//! durable wakes. The engine calls `save_execution` at every step boundary.

use chrono::{DateTime, Utc};
use stepwise_types::definition::WorkflowDefinition;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{ExecutionStatus, ScheduledWake, WorkflowExecution};
use uuid::Uuid;

/// Repository trait for engine persistence.
///
/// Covers three entity families:
/// - **Definitions:** versioned workflow definitions.
/// - **Executions:** whole execution records (audit trail included).
/// - **Wakes:** durable timers for timer tasks, timeouts and escalations.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition keyed by (id, version).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest version of a definition.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// A specific version of a definition.
    fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every definition, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert an execution record.
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions ordered by creation time, optionally filtered by status.
    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Wakes
    // -----------------------------------------------------------------------

    fn schedule_wake(
        &self,
        wake: &ScheduledWake,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Wakes due at or before `now`, ordered by due time.
    fn due_wakes(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduledWake>, RepositoryError>> + Send;

    fn delete_wake(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove every pending wake of one step of one execution.
    fn delete_wakes_for_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
