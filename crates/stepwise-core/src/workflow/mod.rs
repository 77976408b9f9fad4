//! Workflow engine core: condition evaluation, actions, steps, transitions and
//! the durable run loop.
//!
//! - `capability` -- handler, assignment and expression ports plus the handler registry
//! - `clock` -- wall-clock abstraction (system and manual)
//! - `expression` -- JEXL evaluator for script-form conditions
//! - `condition` -- condition tree evaluator
//! - `retry` -- retry decisions and backoff delays
//! - `action` -- action executor (set_variable and handler-backed actions)
//! - `step_runner` -- per-step-type dispatch
//! - `transition` -- outgoing transition selection
//! - `parallel` -- fan-out/join for parallel gateways
//! - `checkpoint` -- persistence of execution state and durable wakes
//! - `executor` -- the `WorkflowEngine` run loop and public operations
//! - `scheduler` -- polling loop that fires due wakes
//! - `graph` / `validator` -- definition-time validation
//! - `definition` -- YAML/JSON parsing and filesystem load/save

pub mod action;
pub mod capability;
pub mod checkpoint;
pub mod clock;
pub mod condition;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod parallel;
pub mod retry;
pub mod scheduler;
pub mod step_runner;
pub mod transition;
pub mod validator;

pub use executor::{EngineError, WorkflowEngine};
pub use validator::validate_definition;
