//! Policy engine: static business rules evaluated against the session every
//! turn.
//!
//! A policy applies when both its phase scope and its direction scope match
//! the turn. Applicable policies contribute their prompt text to the model
//! briefing and, when their predicate fires, a [`PolicyViolation`].

pub mod definitions;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::phase::{CallDirection, Phase};
use crate::session::SessionState;

/// How serious a violation is. `Blocking` forces escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Blocking,
}

/// Business area a policy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCategory {
    Driver,
    Insurer,
    Coverage,
    Modality,
    Protocol,
}

impl std::fmt::Display for PolicyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Driver => "driver",
            Self::Insurer => "insurer",
            Self::Coverage => "coverage",
            Self::Modality => "modality",
            Self::Protocol => "protocol",
        };
        write!(f, "{s}")
    }
}

/// Which call flows a policy watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionScope {
    Inbound,
    Outbound,
    Both,
}

/// Which phases a policy watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseScope {
    Any,
    Only(Vec<Phase>),
}

/// What a predicate found: the offending field and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub field: String,
    pub value: String,
}

impl Finding {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Pure check over session state.
pub type Predicate = Arc<dyn Fn(&SessionState) -> Option<Finding> + Send + Sync>;

/// A violation produced by one policy in one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub policy_id: String,
    pub policy_name: String,
    pub category: PolicyCategory,
    pub severity: Severity,
    pub description: String,
    pub detected_in_field: String,
    pub detected_value: String,
    pub recommended_action: String,
    pub response_template: Option<String>,
}

/// A static business rule.
#[derive(Clone)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub category: PolicyCategory,
    pub description: String,
    pub severity: Severity,
    pub phases: PhaseScope,
    pub directions: Vec<DirectionScope>,
    pub recommended_action: String,
    pub response_template: Option<String>,
    /// Text appended to the model briefing whenever the policy applies.
    pub prompt_injection: String,
    pub predicate: Predicate,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("severity", &self.severity)
            .field("phases", &self.phases)
            .field("directions", &self.directions)
            .finish_non_exhaustive()
    }
}

impl Policy {
    /// Whether this policy is in force for the given phase and direction.
    pub fn applies_to(&self, phase: Phase, direction: CallDirection) -> bool {
        let phase_ok = match &self.phases {
            PhaseScope::Any => true,
            PhaseScope::Only(phases) => phases.contains(&phase),
        };
        let direction_ok = self.directions.iter().any(|d| match d {
            DirectionScope::Both => true,
            DirectionScope::Inbound => direction == CallDirection::Inbound,
            DirectionScope::Outbound => direction == CallDirection::Outbound,
        });
        phase_ok && direction_ok
    }

    /// Run the predicate and dress a finding up as a violation.
    pub fn check(&self, state: &SessionState) -> Option<PolicyViolation> {
        (self.predicate)(state).map(|finding| PolicyViolation {
            policy_id: self.id.clone(),
            policy_name: self.name.clone(),
            category: self.category,
            severity: self.severity,
            description: self.description.clone(),
            detected_in_field: finding.field,
            detected_value: finding.value,
            recommended_action: self.recommended_action.clone(),
            response_template: self.response_template.clone(),
        })
    }
}

/// Result of evaluating every policy for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyEvaluation {
    pub applicable_policy_ids: Vec<String>,
    pub violations: Vec<PolicyViolation>,
    pub prompt_injection_text: String,
}

impl PolicyEvaluation {
    pub fn has_blocking(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Blocking)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &PolicyViolation> {
        self.violations.iter().filter(|v| v.severity == Severity::Blocking)
    }
}

/// Holds the policy set, in declaration order.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policies: Vec<Policy>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }

    /// Engine with the standard transport policies.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(definitions::default_policies(config))
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn policy(&self, id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.id == id)
    }

    /// Evaluate every applicable policy against `state`.
    pub fn evaluate(
        &self,
        state: &SessionState,
        phase: Phase,
        direction: CallDirection,
    ) -> PolicyEvaluation {
        let mut evaluation = PolicyEvaluation::default();
        let mut injections = Vec::new();

        for policy in self.policies.iter().filter(|p| p.applies_to(phase, direction)) {
            evaluation.applicable_policy_ids.push(policy.id.clone());
            if !policy.prompt_injection.is_empty() {
                injections.push(policy.prompt_injection.as_str());
            }
            if let Some(violation) = policy.check(state) {
                evaluation.violations.push(violation);
            }
        }

        evaluation.prompt_injection_text = injections.join("\n\n");
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state() -> SessionState {
        SessionState::new("s-1", CallDirection::Inbound, "María", "Transformas", "Cosalud")
    }

    fn make_policy(id: &str, phases: PhaseScope, fires: bool, severity: Severity) -> Policy {
        Policy {
            id: id.to_string(),
            name: format!("policy {id}"),
            category: PolicyCategory::Protocol,
            description: String::new(),
            severity,
            phases,
            directions: vec![DirectionScope::Both],
            recommended_action: String::new(),
            response_template: None,
            prompt_injection: format!("[{id}]"),
            predicate: Arc::new(move |_| fires.then(|| Finding::new("field", "value"))),
        }
    }

    #[test]
    fn wildcard_and_explicit_phases() {
        let any = make_policy("A", PhaseScope::Any, false, Severity::Info);
        let only = make_policy("B", PhaseScope::Only(vec![Phase::Greeting]), false, Severity::Info);
        assert!(any.applies_to(Phase::Survey, CallDirection::Outbound));
        assert!(only.applies_to(Phase::Greeting, CallDirection::Inbound));
        assert!(!only.applies_to(Phase::Identification, CallDirection::Inbound));
    }

    #[test]
    fn direction_scope_filters() {
        let mut policy = make_policy("A", PhaseScope::Any, false, Severity::Info);
        policy.directions = vec![DirectionScope::Outbound];
        assert!(!policy.applies_to(Phase::Greeting, CallDirection::Inbound));
        assert!(policy.applies_to(Phase::OutboundGreeting, CallDirection::Outbound));
    }

    #[test]
    fn violations_are_exactly_applicable_firing_predicates() {
        let engine = PolicyEngine::new(vec![
            make_policy("FIRES", PhaseScope::Any, true, Severity::Warning),
            make_policy("QUIET", PhaseScope::Any, false, Severity::Warning),
            make_policy("ELSEWHERE", PhaseScope::Only(vec![Phase::Survey]), true, Severity::Blocking),
        ]);
        let result = engine.evaluate(&make_state(), Phase::Greeting, CallDirection::Inbound);
        assert_eq!(result.applicable_policy_ids, vec!["FIRES", "QUIET"]);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].policy_id, "FIRES");
        assert!(!result.has_blocking());
        assert_eq!(result.prompt_injection_text, "[FIRES]\n\n[QUIET]");
    }

    #[test]
    fn inapplicable_policies_do_not_change_result() {
        let base = vec![make_policy("FIRES", PhaseScope::Any, true, Severity::Warning)];
        let before = PolicyEngine::new(base.clone()).evaluate(
            &make_state(),
            Phase::Greeting,
            CallDirection::Inbound,
        );

        let mut extended = base;
        extended.push(make_policy("X", PhaseScope::Only(vec![Phase::Closing]), true, Severity::Blocking));
        let mut outbound_only = make_policy("Y", PhaseScope::Any, true, Severity::Blocking);
        outbound_only.directions = vec![DirectionScope::Outbound];
        extended.push(outbound_only);

        let after = PolicyEngine::new(extended).evaluate(
            &make_state(),
            Phase::Greeting,
            CallDirection::Inbound,
        );
        assert_eq!(before, after);
    }

    #[test]
    fn blocking_violations_are_reported() {
        let engine =
            PolicyEngine::new(vec![make_policy("STOP", PhaseScope::Any, true, Severity::Blocking)]);
        let result = engine.evaluate(&make_state(), Phase::Greeting, CallDirection::Inbound);
        assert!(result.has_blocking());
        assert_eq!(result.blocking().count(), 1);
        assert_eq!(result.violations[0].detected_in_field, "field");
    }

    #[test]
    fn category_display_matches_serde() {
        for category in [
            PolicyCategory::Driver,
            PolicyCategory::Insurer,
            PolicyCategory::Coverage,
            PolicyCategory::Modality,
            PolicyCategory::Protocol,
        ] {
            let json = serde_json::to_value(category).unwrap();
            assert_eq!(json.as_str().unwrap(), category.to_string());
        }
    }
}
