//! Capability ports the host application supplies to the engine.
//!
//! The engine never depends on concrete delivery mechanisms. Service, script,
//! email and custom steps as well as notify/webhook/update_data actions are
//! dispatched by tag through a [`HandlerRegistry`]; user task assignment and
//! script-form conditions go through [`AssignmentResolver`] and
//! [`ExpressionEvaluator`].
//!
//! Handler and assignment traits are object safe (boxed futures) so hosts can
//! register heterogeneous implementations behind `Arc<dyn ...>`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::context::ExecutionContext;
use stepwise_types::definition::{AssignmentPolicy, AssignmentType};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::expression::{ExpressionError, JexlEvaluator};

// ---------------------------------------------------------------------------
// Handler invocation
// ---------------------------------------------------------------------------

/// Default handler tags.
pub mod tags {
    pub const SERVICE_TASK: &str = "service_task";
    pub const SCRIPT_TASK: &str = "script_task";
    pub const EMAIL_TASK: &str = "email_task";
    pub const TIMER_TASK: &str = "timer_task";
    pub const NOTIFY: &str = "notify";
    pub const WEBHOOK: &str = "webhook";
    pub const UPDATE_DATA: &str = "update_data";
    pub const SUB_WORKFLOW: &str = "sub_workflow";
    pub const ESCALATION: &str = "escalation";
}

/// Everything a handler gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    /// Tag the request was dispatched under.
    pub handler: String,
    /// Parameters with templates already resolved.
    pub parameters: Value,
    /// Step input (variables merged with the input mapping).
    pub input: Value,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Set when invoked for an action rather than a step body.
    pub action_id: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Failure reported by a handler. `code` feeds retry_on / no_retry_on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: Option<String>,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// A pluggable step/action implementation.
pub trait StepHandler: Send + Sync {
    fn invoke<'a>(&'a self, request: &'a HandlerRequest) -> BoxFuture<'a, Result<Value, HandlerError>>;
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn invoke<'a>(&'a self, request: &'a HandlerRequest) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin((self.0)(request.clone()))
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Dispatch table keyed by handler tag.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a tag.
    pub fn register(&mut self, tag: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(tag.into(), handler);
    }

    pub fn with(mut self, tag: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(tag, handler);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Assignment resolution
// ---------------------------------------------------------------------------

/// Resolves the principal a user task is assigned to.
pub trait AssignmentResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        policy: &'a AssignmentPolicy,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<String, HandlerError>>;
}

/// Default resolver.
///
/// `user`, `role` and `group` assignments resolve to the configured assignee
/// verbatim. `rule` assignments read the context variable (or path) named by
/// the rule. `system` assignments need a host-supplied resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAssignmentResolver;

impl DirectAssignmentResolver {
    fn resolve_now(policy: &AssignmentPolicy, context: &ExecutionContext) -> Result<String, HandlerError> {
        match policy.assignment_type {
            AssignmentType::User | AssignmentType::Role | AssignmentType::Group => policy
                .assignee
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| HandlerError::new("assignment has no assignee")),
            AssignmentType::Rule => {
                let rule = policy
                    .rule
                    .as_deref()
                    .ok_or_else(|| HandlerError::new("rule assignment has no rule"))?;
                match context.lookup(rule) {
                    Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
                    Some(other) if !other.is_null() && !other.is_string() => Ok(other.to_string()),
                    _ => Err(HandlerError::new(format!(
                        "assignment rule '{rule}' did not resolve to a principal"
                    ))),
                }
            }
            AssignmentType::System => Err(HandlerError::new(
                "system assignment requires a host assignment resolver",
            )),
        }
    }
}

impl AssignmentResolver for DirectAssignmentResolver {
    fn resolve<'a>(
        &'a self,
        policy: &'a AssignmentPolicy,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<String, HandlerError>> {
        let result = Self::resolve_now(policy, context);
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

/// Evaluates script-form conditions. Pure and synchronous.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        script: &str,
        language: Option<&str>,
        context: &ExecutionContext,
    ) -> Result<bool, ExpressionError>;
}

// ---------------------------------------------------------------------------
// Capabilities bundle
// ---------------------------------------------------------------------------

/// The capabilities an engine is constructed with.
#[derive(Clone)]
pub struct Capabilities {
    pub handlers: Arc<HandlerRegistry>,
    pub assignments: Arc<dyn AssignmentResolver>,
    pub expressions: Arc<dyn ExpressionEvaluator>,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers: Arc::new(handlers),
            ..Self::default()
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
            assignments: Arc::new(DirectAssignmentResolver),
            expressions: Arc::new(JexlEvaluator::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}
