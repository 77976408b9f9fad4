//! Definition-time validation.
//!
//! `validate_definition` runs before a definition may become `active` or
//! `published`. Errors block activation; warnings flag structure that runs
//! but is probably unintended (dead ends, unreachable steps, unguarded
//! cycles). Checks walk steps and transitions in declaration order, so the
//! same definition always yields the same report.

use std::collections::HashSet;

use stepwise_types::context::RESERVED_ROOTS;
use stepwise_types::definition::{
    AssignmentType, RetryPolicy, StepType, TimeoutAction, TransitionType, TriggerConfig, WorkflowDefinition,
    WorkflowStep,
};
use stepwise_types::validation::{ValidationCode, ValidationIssue, ValidationReport};

use super::graph::TransitionGraph;

/// Validate a definition and collect every finding.
pub fn validate_definition(def: &WorkflowDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_identity(def, &mut report);
    check_variables(def, &mut report);
    check_steps(def, &mut report);
    check_transitions(def, &mut report);
    check_security(def, &mut report);
    check_trigger(def, &mut report);
    check_graph(def, &mut report);

    report
}

fn check_identity(def: &WorkflowDefinition, report: &mut ValidationReport) {
    if def.name.trim().is_empty() {
        report.error(ValidationIssue::new(
            ValidationCode::NameRequired,
            "workflow name must not be empty",
        ));
    }
    if def.tenant_id.trim().is_empty() {
        report.error(ValidationIssue::new(
            ValidationCode::TenantRequired,
            "workflow must belong to a tenant",
        ));
    }
}

fn check_variables(def: &WorkflowDefinition, report: &mut ValidationReport) {
    for variable in &def.variables {
        if RESERVED_ROOTS.contains(&variable.name.as_str()) {
            report.error(ValidationIssue::new(
                ValidationCode::ReservedVariableName,
                format!(
                    "variable '{}' shadows a reserved lookup namespace ({})",
                    variable.name,
                    RESERVED_ROOTS.join(", ")
                ),
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

fn check_steps(def: &WorkflowDefinition, report: &mut ValidationReport) {
    if def.steps.is_empty() {
        report.error(ValidationIssue::new(
            ValidationCode::NoSteps,
            "workflow must have at least one step",
        ));
        return;
    }

    let starts: Vec<&str> = def
        .steps
        .iter()
        .filter(|s| s.is_start_step)
        .map(|s| s.id.as_str())
        .collect();
    match starts.len() {
        0 => report.error(ValidationIssue::new(
            ValidationCode::NoStartStep,
            "no step is marked as the start step",
        )),
        1 => {}
        _ => report.warning(ValidationIssue::new(
            ValidationCode::MultipleStartSteps,
            format!(
                "{} start steps ({}); '{}' is used",
                starts.len(),
                starts.join(", "),
                starts[0]
            ),
        )),
    }

    if !def.steps.iter().any(|s| s.is_end_step) {
        report.warning(ValidationIssue::new(
            ValidationCode::NoEndStep,
            "no step is marked as an end step",
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if !seen.insert(step.id.as_str()) {
            report.error(
                ValidationIssue::new(
                    ValidationCode::DuplicateStepId,
                    format!("duplicate step id '{}'", step.id),
                )
                .at_step(&step.id),
            );
        }
    }

    for step in &def.steps {
        check_step_configuration(def, step, report);
        check_step_policies(def, step, report);
    }
}

fn missing(step: &WorkflowStep, what: &str) -> ValidationIssue {
    ValidationIssue::new(
        ValidationCode::MissingStepConfiguration,
        format!("{} step '{}' needs {what}", step.step_type, step.id),
    )
    .at_step(&step.id)
}

fn check_step_configuration(def: &WorkflowDefinition, step: &WorkflowStep, report: &mut ValidationReport) {
    let config = &step.configuration;
    match step.step_type {
        StepType::UserTask => match &config.assignment {
            None => report.error(missing(step, "an assignment")),
            Some(policy) => match policy.assignment_type {
                AssignmentType::Rule if policy.rule.as_deref().is_none_or(|r| r.trim().is_empty()) => {
                    report.error(missing(step, "an assignment rule"));
                }
                AssignmentType::User | AssignmentType::Role | AssignmentType::Group
                    if policy.assignee.as_deref().is_none_or(|a| a.trim().is_empty()) =>
                {
                    report.error(missing(step, "an assignee"));
                }
                _ => {}
            },
        },
        StepType::ServiceTask => {
            let has_target = config.handler.is_some()
                || ["service", "url", "endpoint"].iter().any(|k| config.has_param(k));
            if !has_target {
                report.error(missing(step, "a handler or a service/url/endpoint parameter"));
            }
        }
        StepType::EmailTask => {
            if !config.has_param("to") && !config.has_param("recipient") {
                report.error(missing(step, "a recipient"));
            }
            if !config.has_param("subject") {
                report.error(missing(step, "a subject"));
            }
        }
        StepType::TimerTask => {
            if !config.has_param("duration_secs") && !config.has_param("until") {
                report.error(missing(step, "duration_secs or until"));
            }
        }
        StepType::Loop => match &config.loop_config {
            Some(cfg) if cfg.max_iterations > 0 => {}
            Some(_) => report.error(
                ValidationIssue::new(
                    ValidationCode::InvalidLoop,
                    format!("loop step '{}' needs max_iterations > 0", step.id),
                )
                .at_step(&step.id),
            ),
            None => report.error(
                ValidationIssue::new(
                    ValidationCode::InvalidLoop,
                    format!("loop step '{}' has no loop configuration", step.id),
                )
                .at_step(&step.id),
            ),
        },
        StepType::Parallel if def.configuration.parallel_execution_enabled => {
            let join = config.parallel.as_ref().map(|p| p.join_step_id.as_str());
            match join {
                Some(join) if def.step(join).is_some() && join != step.id => {}
                Some(join) => report.error(
                    ValidationIssue::new(
                        ValidationCode::InvalidParallelJoin,
                        format!("parallel step '{}' joins at unknown step '{join}'", step.id),
                    )
                    .at_step(&step.id),
                ),
                None => report.error(
                    ValidationIssue::new(
                        ValidationCode::InvalidParallelJoin,
                        format!("parallel step '{}' has no join step", step.id),
                    )
                    .at_step(&step.id),
                ),
            }
        }
        _ => {}
    }
}

fn check_step_policies(def: &WorkflowDefinition, step: &WorkflowStep, report: &mut ValidationReport) {
    if let Some(timeout) = &step.timeout {
        if timeout.action == TimeoutAction::GoToStep {
            let target_ok = timeout
                .target_step_id
                .as_deref()
                .is_some_and(|t| def.step(t).is_some());
            if !target_ok {
                report.error(
                    ValidationIssue::new(
                        ValidationCode::InvalidTimeoutTarget,
                        format!(
                            "timeout of step '{}' jumps to unknown step '{}'",
                            step.id,
                            timeout.target_step_id.as_deref().unwrap_or("")
                        ),
                    )
                    .at_step(&step.id),
                );
            }
        }
    }

    if step.retry.as_ref().is_some_and(invalid_retry) {
        report.error(
            ValidationIssue::new(
                ValidationCode::InvalidRetryPolicy,
                format!("retry policy of step '{}' allows no attempts", step.id),
            )
            .at_step(&step.id),
        );
    }
    for action in &step.actions {
        if action.retry.as_ref().is_some_and(invalid_retry) {
            report.error(
                ValidationIssue::new(
                    ValidationCode::InvalidRetryPolicy,
                    format!("retry policy of action '{}' allows no attempts", action.id),
                )
                .at_step(&step.id),
            );
        }
    }
}

fn invalid_retry(policy: &RetryPolicy) -> bool {
    policy.max_attempts == 0
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

fn check_transitions(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for t in &def.transitions {
        if !seen.insert(t.id.as_str()) {
            report.error(
                ValidationIssue::new(
                    ValidationCode::DuplicateTransitionId,
                    format!("duplicate transition id '{}'", t.id),
                )
                .at_transition(&t.id),
            );
        }

        for endpoint in [&t.from_step_id, &t.to_step_id] {
            if def.step(endpoint).is_none() {
                report.error(
                    ValidationIssue::new(
                        ValidationCode::DanglingTransition,
                        format!("transition '{}' references unknown step '{endpoint}'", t.id),
                    )
                    .at_transition(&t.id),
                );
            }
        }

        if t.from_step_id == t.to_step_id {
            report.error(
                ValidationIssue::new(
                    ValidationCode::SelfLoopTransition,
                    format!(
                        "transition '{}' loops on step '{}'; use a loop step instead",
                        t.id, t.from_step_id
                    ),
                )
                .at_step(&t.from_step_id)
                .at_transition(&t.id),
            );
        }

        if t.actions.iter().any(|a| a.retry.as_ref().is_some_and(invalid_retry)) {
            report.error(
                ValidationIssue::new(
                    ValidationCode::InvalidRetryPolicy,
                    format!("an action of transition '{}' allows no attempts", t.id),
                )
                .at_transition(&t.id),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Security and trigger
// ---------------------------------------------------------------------------

fn check_security(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let security = &def.security;
    if security.require_authentication && security.allowed_roles.is_empty() && security.allowed_users.is_empty() {
        report.error(ValidationIssue::new(
            ValidationCode::InvalidSecurityPolicy,
            "authentication is required but no roles or users are allowed",
        ));
    }
}

fn check_trigger(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let problem = match &def.trigger {
        TriggerConfig::Manual {} => None,
        TriggerConfig::Schedule { cron, .. } => {
            let trimmed = cron.trim();
            let expr = match trimmed.split_whitespace().count() {
                5 => Some(format!("0 {trimmed}")),
                6 => Some(trimmed.to_string()),
                _ => None,
            };
            match expr.map(|e| e.parse::<croner::Cron>()) {
                Some(Ok(_)) => None,
                Some(Err(e)) => Some(format!("invalid cron schedule '{cron}': {e}")),
                None => Some(format!("cron schedule '{cron}' must have 5 or 6 fields")),
            }
        }
        TriggerConfig::Event { event_type } if event_type.trim().is_empty() => {
            Some("event trigger needs an event type".to_string())
        }
        TriggerConfig::Webhook { path } if path.trim().is_empty() => {
            Some("webhook trigger needs a path".to_string())
        }
        _ => None,
    };
    if let Some(message) = problem {
        report.error(ValidationIssue::new(ValidationCode::InvalidTrigger, message));
    }
}

// ---------------------------------------------------------------------------
// Graph shape (warnings)
// ---------------------------------------------------------------------------

fn check_graph(def: &WorkflowDefinition, report: &mut ValidationReport) {
    let graph = TransitionGraph::build(def);

    if let Some(start) = def.start_step() {
        let reachable = graph.reachable_from(&start.id);
        let end_reachable = def
            .steps
            .iter()
            .any(|s| s.is_end_step && reachable.contains(s.id.as_str()));
        if !end_reachable && def.steps.iter().any(|s| s.is_end_step) {
            report.warning(ValidationIssue::new(
                ValidationCode::NoReachableEndStep,
                format!("no end step is reachable from start step '{}'", start.id),
            ));
        }
        for step in &def.steps {
            if !reachable.contains(step.id.as_str()) && !step.is_start_step {
                report.warning(
                    ValidationIssue::new(
                        ValidationCode::UnreachableStep,
                        format!("step '{}' is not reachable from the start step", step.id),
                    )
                    .at_step(&step.id),
                );
            }
        }
    }

    for step in &def.steps {
        let outgoing = def.outgoing(&step.id);
        if step.is_end_step {
            if !outgoing.is_empty() {
                report.warning(
                    ValidationIssue::new(
                        ValidationCode::EndStepHasTransitions,
                        format!("end step '{}' has outgoing transitions that are never taken", step.id),
                    )
                    .at_step(&step.id),
                );
            }
            continue;
        }

        let normal: Vec<_> = outgoing
            .iter()
            .filter(|(_, t)| t.transition_type != TransitionType::Exception)
            .collect();
        if normal.is_empty() {
            report.warning(
                ValidationIssue::new(
                    ValidationCode::DeadEndStep,
                    format!("step '{}' is not an end step and has no outgoing transitions", step.id),
                )
                .at_step(&step.id),
            );
        } else if !normal.iter().any(|(_, t)| t.is_fallback()) {
            report.warning(
                ValidationIssue::new(
                    ValidationCode::NoDefaultTransition,
                    format!(
                        "all transitions out of '{}' are conditional; the run dead-ends when none match",
                        step.id
                    ),
                )
                .at_step(&step.id),
            );
        }
    }

    for cycle in graph.unguarded_cycles() {
        report.warning(
            ValidationIssue::new(
                ValidationCode::UnguardedCycle,
                format!("cycle {} passes through no loop step", cycle.join(" -> ")),
            )
            .at_step(cycle[0]),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::condition::{ConditionOperator, WorkflowCondition};
    use stepwise_types::definition::{AssignmentPolicy, LoopConfig, TimeoutPolicy, WorkflowTransition};

    fn approval() -> WorkflowStep {
        let mut step = WorkflowStep::new("approve", StepType::UserTask);
        step.configuration.assignment = Some(AssignmentPolicy::direct(AssignmentType::Role, "role:Approver"));
        step
    }

    fn def(steps: Vec<WorkflowStep>, transitions: Vec<WorkflowTransition>) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "id": "01938e90-0000-7000-8000-0000000000dd",
            "name": "expense-approval",
            "tenant_id": "acme",
            "steps": steps,
            "transitions": transitions,
        }))
        .unwrap()
    }

    fn linear() -> WorkflowDefinition {
        def(
            vec![
                WorkflowStep::new("start", StepType::Start),
                approval(),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "approve"),
                WorkflowTransition::new("t2", "approve", "end"),
            ],
        )
    }

    #[test]
    fn test_valid_definition_is_clean() {
        let report = validate_definition(&linear());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_missing_start_is_error_multiple_starts_is_warning() {
        let mut d = linear();
        d.steps[0].is_start_step = false;
        let report = validate_definition(&d);
        assert!(report.has_error(ValidationCode::NoStartStep));

        let mut d = linear();
        d.steps[1].is_start_step = true;
        let report = validate_definition(&d);
        assert!(report.is_valid());
        assert!(report.has_warning(ValidationCode::MultipleStartSteps));
    }

    #[test]
    fn test_reserved_variable_name_is_error() {
        let mut d = linear();
        d.variables = serde_json::from_value(json!([
            { "name": "amount", "type": "number" },
            { "name": "trigger", "type": "string" },
        ]))
        .unwrap();
        let report = validate_definition(&d);
        assert!(report.has_error(ValidationCode::ReservedVariableName));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("'trigger'"));
    }

    #[test]
    fn test_self_loop_transition_is_error() {
        let mut d = linear();
        d.transitions.push(WorkflowTransition::new("again", "approve", "approve"));
        let report = validate_definition(&d);
        assert!(report.has_error(ValidationCode::SelfLoopTransition));
        let issue = report
            .errors
            .iter()
            .find(|i| i.code == ValidationCode::SelfLoopTransition)
            .unwrap();
        assert_eq!(issue.transition_id.as_deref(), Some("again"));
    }

    #[test]
    fn test_identity_security_and_step_configuration() {
        let mut d = def(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("approve", StepType::UserTask),
                WorkflowStep::new("call", StepType::ServiceTask),
                WorkflowStep::new("mail", StepType::EmailTask),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "approve"),
                WorkflowTransition::new("t2", "approve", "call"),
                WorkflowTransition::new("t3", "call", "mail"),
                WorkflowTransition::new("t4", "mail", "end"),
                WorkflowTransition::new("t5", "mail", "nowhere"),
            ],
        );
        d.name = String::new();
        d.tenant_id = String::new();
        d.security.require_authentication = true;

        let report = validate_definition(&d);
        for code in [
            ValidationCode::NameRequired,
            ValidationCode::TenantRequired,
            ValidationCode::InvalidSecurityPolicy,
            ValidationCode::DanglingTransition,
        ] {
            assert!(report.has_error(code), "missing {code:?}");
        }
        let config_steps: Vec<_> = report
            .errors
            .iter()
            .filter(|i| i.code == ValidationCode::MissingStepConfiguration)
            .filter_map(|i| i.step_id.as_deref())
            .collect();
        assert_eq!(config_steps, vec!["approve", "call", "mail", "mail"]);
    }

    #[test]
    fn test_supplementary_structure_checks() {
        let mut timer = WorkflowStep::new("wait", StepType::TimerTask);
        timer.timeout = Some(TimeoutPolicy {
            duration_secs: 10,
            action: TimeoutAction::GoToStep,
            target_step_id: Some("missing".into()),
        });
        let mut again = WorkflowStep::new("again", StepType::Loop);
        again.configuration.loop_config = Some(LoopConfig {
            condition: None,
            max_iterations: 0,
        });
        let mut d = def(
            vec![
                WorkflowStep::new("start", StepType::Start),
                timer,
                again,
                WorkflowStep::new("start", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "wait"),
                WorkflowTransition::new("t1", "wait", "again"),
                WorkflowTransition::new("t3", "again", "end"),
            ],
        );
        d.trigger = TriggerConfig::Schedule {
            cron: "not a cron".into(),
            timezone: None,
        };

        let report = validate_definition(&d);
        for code in [
            ValidationCode::DuplicateStepId,
            ValidationCode::DuplicateTransitionId,
            ValidationCode::MissingStepConfiguration,
            ValidationCode::InvalidTimeoutTarget,
            ValidationCode::InvalidLoop,
            ValidationCode::InvalidTrigger,
        ] {
            assert!(report.has_error(code), "missing {code:?}");
        }

        d.trigger = TriggerConfig::Schedule {
            cron: "0 9 * * 1-5".into(),
            timezone: None,
        };
        assert!(!validate_definition(&d).has_error(ValidationCode::InvalidTrigger));
    }

    #[test]
    fn test_graph_warnings() {
        let d = def(
            vec![
                WorkflowStep::new("start", StepType::Start),
                WorkflowStep::new("a", StepType::Task),
                WorkflowStep::new("b", StepType::Task),
                WorkflowStep::new("orphan", StepType::Task),
                WorkflowStep::new("end", StepType::End),
            ],
            vec![
                WorkflowTransition::new("t1", "start", "a"),
                WorkflowTransition::new("t2", "a", "b"),
                WorkflowTransition::new("t3", "b", "a").when(WorkflowCondition::compare(
                    "retry",
                    ConditionOperator::Equals,
                    json!(true),
                )),
                WorkflowTransition::new("t4", "end", "a"),
            ],
        );

        let report = validate_definition(&d);
        assert!(report.is_valid(), "{:?}", report.errors);
        for code in [
            ValidationCode::NoReachableEndStep,
            ValidationCode::UnreachableStep,
            ValidationCode::DeadEndStep,
            ValidationCode::NoDefaultTransition,
            ValidationCode::EndStepHasTransitions,
            ValidationCode::UnguardedCycle,
        ] {
            assert!(report.has_warning(code), "missing {code:?}");
        }
        assert_eq!(validate_definition(&d), report);
    }
}
