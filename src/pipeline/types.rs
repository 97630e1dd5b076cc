//! Shared types for the turn pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::escalation::{EscalationDecision, IncidentType};
use crate::llm::{ChatMessage, Role, TurnReply};
use crate::phase::Phase;
use crate::policy::PolicyEvaluation;
use crate::session::{SESSION_SCHEMA_VERSION, SessionState};

// ── Intent analysis ─────────────────────────────────────────────────

/// Dominant emotion detected in the caller's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Frustration,
    Confusion,
    Positive,
}

/// How strongly the emotion shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionLevel {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Confirm,
    Deny,
    Change,
    Cancel,
    Complaint,
    Question,
    Greeting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Schedule,
    Address,
    Driver,
    Date,
    Service,
}

/// Policy areas the caller touched on, used to brief the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKeyword {
    AddressChange,
    CoverageZone,
    Companion,
    Driver,
    Minor,
}

/// Rule-based reading of the latest caller message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub emotion: Emotion,
    pub emotion_level: EmotionLevel,
    pub intents: Vec<Intent>,
    pub topics: Vec<Topic>,
    pub policy_keywords: Vec<PolicyKeyword>,
    pub incident_type: Option<IncidentType>,
    /// Insurer the caller named in this message, if any.
    pub declared_insurer: Option<String>,
    pub needs_empathy: bool,
}

/// Extra briefing derived from the analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub tone_instruction: String,
    pub policy_notes: Vec<String>,
}

// ── Special cases ───────────────────────────────────────────────────

/// Situations that end automated handling with a fixed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialCase {
    Escalation,
    WrongNumber,
    PatientDeceased,
}

impl SpecialCase {
    /// Note written to the patient record when this case ends the call.
    pub fn observation(self) -> Option<&'static str> {
        match self {
            Self::Escalation => None,
            Self::WrongNumber => Some("Número equivocado"),
            Self::PatientDeceased => Some("Paciente fallecido"),
        }
    }
}

// ── Turn metadata ───────────────────────────────────────────────────

/// A model-proposed transition that the phase guard refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAnomaly {
    pub current: Phase,
    pub proposed: Phase,
}

/// Diagnostics returned alongside the reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// The model call failed, timed out or returned malformed output.
    pub llm_parse_error: bool,
    pub llm_error: Option<String>,
    pub llm_calls: u32,
    pub phase_anomaly: Option<PhaseAnomaly>,
    /// Validator rewrites applied to the model reply.
    pub corrections: Vec<String>,
    pub warnings: Vec<String>,
    /// The model reply was replaced by a safe template.
    pub validation_fallback: bool,
    pub policy_violations: Vec<String>,
    pub special_case: Option<SpecialCase>,
    pub data_sink_written: bool,
    /// Names of the stages visited, in order.
    pub stages: Vec<String>,
}

// ── Turn context ────────────────────────────────────────────────────

/// Everything one pipeline run reads and writes.
///
/// Starts as the loaded session (with the new message already appended) and
/// is threaded through each stage by value.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub state: SessionState,
    /// The caller's message for this turn.
    pub input: String,

    pub analysis: Analysis,
    pub enrichment: Enrichment,
    pub policy: PolicyEvaluation,
    pub eligibility_issues: Vec<String>,
    pub escalation: EscalationDecision,

    /// Messages prepared for the model.
    pub prompt: Vec<ChatMessage>,
    pub reply: Option<TurnReply>,
    /// Reply that will be spoken to the caller.
    pub agent_response: String,
    /// Non-empty extracted fields accepted this turn.
    pub extracted: Map<String, Value>,
    pub special_case: Option<SpecialCase>,
    pub metadata: TurnMetadata,

    /// Phase changes applied this turn, in order.
    pub transitions: Vec<(Phase, Phase)>,

    entry_turn_count: u32,
    entry_log_len: usize,
    entry_phase: Phase,
}

impl TurnContext {
    /// Wrap a session whose log already ends with `input` from the user.
    pub fn new(state: SessionState, input: impl Into<String>) -> Self {
        let entry_turn_count = state.turn_count;
        let entry_log_len = state.messages().len();
        let entry_phase = state.current_phase;
        Self {
            state,
            input: input.into(),
            analysis: Analysis::default(),
            enrichment: Enrichment::default(),
            policy: PolicyEvaluation::default(),
            eligibility_issues: Vec::new(),
            escalation: EscalationDecision::default(),
            prompt: Vec::new(),
            reply: None,
            agent_response: String::new(),
            extracted: Map::new(),
            special_case: None,
            metadata: TurnMetadata::default(),
            transitions: Vec::new(),
            entry_turn_count,
            entry_log_len,
            entry_phase,
        }
    }

    /// Apply a proposed phase through the guard. Returns the resulting phase.
    pub fn apply_phase(&mut self, proposed: Phase) -> Phase {
        let current = self.state.current_phase;
        let next = Phase::resolve(current, proposed);
        if next != current {
            self.transitions.push((current, next));
            self.state.current_phase = next;
            self.state.validation_attempt_count = 0;
        }
        next
    }

    /// Checks made before the first stage runs.
    pub fn validate_entry(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidContext {
            stage: "entry".to_string(),
            reason,
        };
        if self.state.schema_version != SESSION_SCHEMA_VERSION {
            return Err(invalid(format!(
                "session schema version {} is not supported",
                self.state.schema_version
            )));
        }
        match self.state.messages().last() {
            Some(last) if last.role == Role::User && last.content == self.input => Ok(()),
            _ => Err(invalid("log must end with the current user message".to_string())),
        }
    }

    /// Checks made after the last stage runs.
    pub fn validate_exit(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidContext {
            stage: "exit".to_string(),
            reason,
        };
        if self.state.turn_count != self.entry_turn_count + 1 {
            return Err(invalid(format!(
                "turn count moved from {} to {}",
                self.entry_turn_count, self.state.turn_count
            )));
        }
        if self.state.messages().len() != self.entry_log_len {
            return Err(invalid("conversation log changed during the turn".to_string()));
        }
        if self.metadata.llm_calls > 1 {
            return Err(invalid(format!("{} model calls in one turn", self.metadata.llm_calls)));
        }

        let mut phase = self.entry_phase;
        for (from, to) in &self.transitions {
            if *from != phase || !from.can_transition_to(*to) {
                return Err(invalid(format!("illegal transition {from} -> {to}")));
            }
            phase = *to;
        }
        if phase != self.state.current_phase {
            return Err(invalid(format!(
                "phase {} not explained by recorded transitions",
                self.state.current_phase
            )));
        }
        if self.agent_response.trim().is_empty() {
            return Err(invalid("no reply produced".to_string()));
        }
        Ok(())
    }
}
