//! Definition validation report.

use serde::{Deserialize, Serialize};

/// Result of validating a definition. Errors block activation, warnings do
/// not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_error(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|i| i.code == code)
    }

    pub fn has_warning(&self, code: ValidationCode) -> bool {
        self.warnings.iter().any(|i| i.code == code)
    }

    pub fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    pub fn warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id: None,
            transition_id: None,
        }
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn at_transition(mut self, transition_id: impl Into<String>) -> Self {
        self.transition_id = Some(transition_id.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    NameRequired,
    TenantRequired,
    NoSteps,
    NoStartStep,
    MultipleStartSteps,
    NoEndStep,
    DuplicateStepId,
    DuplicateTransitionId,
    MissingStepConfiguration,
    DanglingTransition,
    SelfLoopTransition,
    InvalidSecurityPolicy,
    InvalidTrigger,
    InvalidTimeoutTarget,
    InvalidParallelJoin,
    InvalidLoop,
    InvalidRetryPolicy,
    NoReachableEndStep,
    UnreachableStep,
    DeadEndStep,
    NoDefaultTransition,
    EndStepHasTransitions,
    UnguardedCycle,
    ReservedVariableName,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::NameRequired => "name_required",
            ValidationCode::TenantRequired => "tenant_required",
            ValidationCode::NoSteps => "no_steps",
            ValidationCode::NoStartStep => "no_start_step",
            ValidationCode::MultipleStartSteps => "multiple_start_steps",
            ValidationCode::NoEndStep => "no_end_step",
            ValidationCode::DuplicateStepId => "duplicate_step_id",
            ValidationCode::DuplicateTransitionId => "duplicate_transition_id",
            ValidationCode::MissingStepConfiguration => "missing_step_configuration",
            ValidationCode::DanglingTransition => "dangling_transition",
            ValidationCode::SelfLoopTransition => "self_loop_transition",
            ValidationCode::InvalidSecurityPolicy => "invalid_security_policy",
            ValidationCode::InvalidTrigger => "invalid_trigger",
            ValidationCode::InvalidTimeoutTarget => "invalid_timeout_target",
            ValidationCode::InvalidParallelJoin => "invalid_parallel_join",
            ValidationCode::InvalidLoop => "invalid_loop",
            ValidationCode::InvalidRetryPolicy => "invalid_retry_policy",
            ValidationCode::NoReachableEndStep => "no_reachable_end_step",
            ValidationCode::UnreachableStep => "unreachable_step",
            ValidationCode::DeadEndStep => "dead_end_step",
            ValidationCode::NoDefaultTransition => "no_default_transition",
            ValidationCode::EndStepHasTransitions => "end_step_has_transitions",
            ValidationCode::UnguardedCycle => "unguarded_cycle",
            ValidationCode::ReservedVariableName => "reserved_variable_name",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_validity_and_lookup() {
        let mut report = ValidationReport::default();
        assert!(report.is_valid());
        report.warning(ValidationIssue::new(ValidationCode::NoEndStep, "no end step"));
        assert!(report.is_valid());
        assert!(report.has_warning(ValidationCode::NoEndStep));
        report.error(ValidationIssue::new(ValidationCode::NoStartStep, "no start step"));
        assert!(!report.is_valid());
        assert!(report.has_error(ValidationCode::NoStartStep));
        assert!(!report.has_error(ValidationCode::NoEndStep));
    }

    #[test]
    fn test_issue_display() {
        let issue = ValidationIssue::new(ValidationCode::SelfLoopTransition, "t1 loops on 'a'")
            .at_transition("t1");
        assert_eq!(issue.to_string(), "[self_loop_transition] t1 loops on 'a'");
    }
}
