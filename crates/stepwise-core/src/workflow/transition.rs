//! Transition resolver: picks the next step after a step finishes.
//!
//! Outgoing transitions are ordered by `priority` ascending, ties broken by
//! declaration order. The first conditional transition whose condition holds
//! wins; otherwise the first unconditional or `default` transition. When the
//! source step failed (and was allowed to continue), `exception` transitions
//! are tried first. The winning transition's actions run exactly once.

use stepwise_types::context::ExecutionContext;
use stepwise_types::definition::{TransitionType, WorkflowDefinition, WorkflowTransition};
use stepwise_types::execution::{ActionOrigin, WorkflowActionExecution};
use tracing::debug;
use uuid::Uuid;

use super::action::{ActionExecutor, ActionScope};
use super::condition::{ConditionError, ConditionEvaluator};

/// Outcome of resolving one traversal.
#[derive(Debug, Default)]
pub struct Resolution {
    /// `None` is a dead end.
    pub transition: Option<WorkflowTransition>,
    pub action_executions: Vec<WorkflowActionExecution>,
    /// `(action_id, message)` of a failed required transition action.
    pub failure: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct TransitionResolver {
    actions: ActionExecutor,
    conditions: ConditionEvaluator,
}

impl TransitionResolver {
    pub fn new(actions: ActionExecutor, conditions: ConditionEvaluator) -> Self {
        Self { actions, conditions }
    }

    /// Outgoing transitions of `from_step_id` in evaluation order.
    pub fn ordered<'d>(def: &'d WorkflowDefinition, from_step_id: &str) -> Vec<&'d WorkflowTransition> {
        let mut out = def.outgoing(from_step_id);
        out.sort_by_key(|(index, t)| (t.priority, *index));
        out.into_iter().map(|(_, t)| t).collect()
    }

    /// Pick the winning transition without running its actions.
    pub fn select<'d>(
        &self,
        def: &'d WorkflowDefinition,
        from_step_id: &str,
        source_failed: bool,
        ctx: &ExecutionContext,
    ) -> Result<Option<&'d WorkflowTransition>, ConditionError> {
        let ordered = Self::ordered(def, from_step_id);
        let (exceptions, normal): (Vec<_>, Vec<_>) = ordered
            .into_iter()
            .partition(|t| t.transition_type == TransitionType::Exception);

        if source_failed {
            if let Some(t) = self.first_match(&exceptions, ctx)? {
                return Ok(Some(t));
            }
        }
        self.first_match(&normal, ctx)
    }

    fn first_match<'d>(
        &self,
        candidates: &[&'d WorkflowTransition],
        ctx: &ExecutionContext,
    ) -> Result<Option<&'d WorkflowTransition>, ConditionError> {
        for t in candidates.iter().copied().filter(|t| !t.is_fallback()) {
            if self.conditions.holds(t.condition.as_ref(), ctx)? {
                return Ok(Some(t));
            }
        }
        Ok(candidates.iter().copied().find(|t| t.is_fallback()))
    }

    /// Select the next transition and run its actions.
    pub async fn resolve(
        &self,
        def: &WorkflowDefinition,
        from_step_id: &str,
        source_failed: bool,
        ctx: &mut ExecutionContext,
        execution_id: Uuid,
    ) -> Result<Resolution, ConditionError> {
        let Some(transition) = self.select(def, from_step_id, source_failed, ctx)?.cloned() else {
            debug!(execution_id = %execution_id, step_id = from_step_id, "no transition matched");
            return Ok(Resolution::default());
        };

        debug!(
            execution_id = %execution_id,
            step_id = from_step_id,
            transition_id = %transition.id,
            to_step_id = %transition.to_step_id,
            "transition selected"
        );

        let origin = ActionOrigin::Transition {
            transition_id: transition.id.clone(),
        };
        let scope = ActionScope {
            execution_id,
            step_id: from_step_id,
        };
        let (action_executions, failure) = self
            .actions
            .execute_all(&transition.actions, &origin, ctx, scope)
            .await;

        Ok(Resolution {
            transition: Some(transition),
            action_executions,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::workflow::capability::{Capabilities, HandlerRegistry};
    use crate::workflow::expression::JexlEvaluator;
    use serde_json::json;
    use stepwise_types::action::WorkflowAction;
    use stepwise_types::condition::{ConditionOperator, WorkflowCondition};
    use stepwise_types::definition::{StepType, WorkflowStep};

    fn resolver() -> TransitionResolver {
        let caps = Capabilities::new(HandlerRegistry::new());
        TransitionResolver::new(
            ActionExecutor::new(&caps, Duration::from_secs(1)),
            ConditionEvaluator::new(Arc::new(JexlEvaluator::new())),
        )
    }

    fn def(transitions: Vec<WorkflowTransition>) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": "01938e90-0000-7000-8000-0000000000bb",
            "name": "routing",
            "steps": [
                WorkflowStep::new("a", StepType::Decision),
                WorkflowStep::new("b", StepType::End),
                WorkflowStep::new("c", StepType::End),
                WorkflowStep::new("d", StepType::End),
            ],
            "transitions": transitions,
        }))
        .unwrap()
    }

    fn gt(var: &str, n: i64) -> WorkflowCondition {
        WorkflowCondition::compare(var, ConditionOperator::GreaterThan, json!(n))
    }

    #[test]
    fn test_priority_then_declaration_order() {
        let d = def(vec![
            WorkflowTransition::new("t1", "a", "b").when(gt("x", 0)).with_priority(5),
            WorkflowTransition::new("t2", "a", "c").when(gt("x", 0)).with_priority(1),
            WorkflowTransition::new("t3", "a", "d").when(gt("x", 0)).with_priority(1),
        ]);
        let ctx = ExecutionContext::new().with_variable("x", json!(1));
        for _ in 0..10 {
            let t = resolver().select(&d, "a", false, &ctx).unwrap().unwrap();
            assert_eq!(t.id, "t2");
        }
        let ids: Vec<_> = TransitionResolver::ordered(&d, "a").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3", "t1"]);
    }

    #[test]
    fn test_conditional_beats_unconditional_fallback() {
        let d = def(vec![
            WorkflowTransition::new("fallback", "a", "c"),
            WorkflowTransition::new("big", "a", "b").when(gt("amount", 1000)).with_priority(10),
        ]);
        let big = ExecutionContext::new().with_variable("amount", json!(1500));
        let small = ExecutionContext::new().with_variable("amount", json!(500));
        assert_eq!(resolver().select(&d, "a", false, &big).unwrap().unwrap().id, "big");
        assert_eq!(resolver().select(&d, "a", false, &small).unwrap().unwrap().id, "fallback");
    }

    #[test]
    fn test_dead_end_when_nothing_matches() {
        let d = def(vec![WorkflowTransition::new("only", "a", "b").when(gt("amount", 1000))]);
        let ctx = ExecutionContext::new().with_variable("amount", json!(5));
        assert!(resolver().select(&d, "a", false, &ctx).unwrap().is_none());
    }

    #[test]
    fn test_exception_transitions_only_after_failure() {
        let mut on_error = WorkflowTransition::new("err", "a", "d");
        on_error.transition_type = TransitionType::Exception;
        let d = def(vec![WorkflowTransition::new("ok", "a", "b"), on_error]);
        let ctx = ExecutionContext::new();
        assert_eq!(resolver().select(&d, "a", false, &ctx).unwrap().unwrap().id, "ok");
        assert_eq!(resolver().select(&d, "a", true, &ctx).unwrap().unwrap().id, "err");
    }

    #[tokio::test]
    async fn test_resolve_runs_transition_actions_once() {
        let mut t = WorkflowTransition::new("t", "a", "b");
        t.actions = vec![WorkflowAction::set_variable("mark", "routed", json!("b"))];
        let d = def(vec![t]);
        let mut ctx = ExecutionContext::new();

        let res = resolver()
            .resolve(&d, "a", false, &mut ctx, Uuid::nil())
            .await
            .unwrap();
        assert_eq!(res.transition.unwrap().to_step_id, "b");
        assert_eq!(res.action_executions.len(), 1);
        assert_eq!(
            res.action_executions[0].origin,
            ActionOrigin::Transition { transition_id: "t".into() }
        );
        assert!(res.failure.is_none());
        assert_eq!(ctx.get_variable("routed"), Some(&json!("b")));
    }
}
