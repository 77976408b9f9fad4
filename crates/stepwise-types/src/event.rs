//! Lifecycle events broadcast by the engine.
//!
//! `EngineEvent` is Clone + Send + Sync for use with tokio broadcast channels.
//! The audit trail on the execution record stays the source of truth; events
//! are a live view for hosts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ErrorCode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
    },

    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        attempts: u32,
    },

    /// A step is parked awaiting a signal or a timer.
    StepWaiting {
        execution_id: Uuid,
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assigned_to: Option<String>,
    },

    StepEscalated {
        execution_id: Uuid,
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalated_to: Option<String>,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
    },

    ExecutionFailed {
        execution_id: Uuid,
        code: ErrorCode,
        error: String,
    },

    ExecutionCancelled { execution_id: Uuid },

    ExecutionSuspended { execution_id: Uuid },
}

impl EngineEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::StepStarted { execution_id, .. }
            | EngineEvent::StepCompleted { execution_id, .. }
            | EngineEvent::StepFailed { execution_id, .. }
            | EngineEvent::StepWaiting { execution_id, .. }
            | EngineEvent::StepEscalated { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionCancelled { execution_id }
            | EngineEvent::ExecutionSuspended { execution_id } => *execution_id,
        }
    }
}
