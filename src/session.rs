//! Session state: everything one call has accumulated so far.
//!
//! A `SessionState` is owned by the orchestrator between turns and only
//! mutated inside a pipeline run. The message log is append-only; callers read
//! it through [`SessionState::messages`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::escalation::IncidentType;
use crate::llm::Role;
use crate::phase::{CallDirection, Phase};
use crate::policy::PolicyViolation;

/// Bumped whenever the persisted layout changes incompatibly.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Patient and contact data, filled in as the caller provides it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub full_name: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    /// Health insurer (EPS) the patient declares.
    pub insurer: Option<String>,
    pub phone: Option<String>,
    /// Whether the person on the line is responsible for the patient.
    pub is_responsible: Option<bool>,
    pub responsible_name: Option<String>,
    /// Person answering an outbound call, when not the patient.
    pub contact_name: Option<String>,
    pub contact_relationship: Option<String>,
    pub contact_age: Option<u32>,
}

/// Trip details, filled in incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_type: Option<String>,
    pub treatment_type: Option<String>,
    pub frequency: Option<String>,
    /// One date or a comma-separated schedule.
    pub appointment_date: Option<String>,
    pub appointment_time: Option<String>,
    pub pickup_address: Option<String>,
    pub destination_address: Option<String>,
    pub modality: Option<String>,
    pub special_observations: Option<String>,
    /// `None` until the caller tells us either way.
    pub has_authorization: Option<bool>,
}

/// Confirmation outcome of an outbound call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundTracking {
    pub service_confirmed: bool,
    pub confirmation_status: Option<String>,
    pub new_appointment_date: Option<String>,
    pub patient_away: bool,
    pub return_date: Option<String>,
    pub special_needs: Vec<String>,
    pub coverage_issue: bool,
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A problem reported during the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub summary: String,
    pub kind: IncidentType,
    pub recorded_at: DateTime<Utc>,
}

/// Accumulated state of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: u32,
    pub session_id: String,
    pub direction: CallDirection,
    pub current_phase: Phase,
    pub agent_name: String,
    pub company_name: String,
    pub insurer_name: String,

    pub patient: PatientInfo,
    pub service: ServiceInfo,
    pub outbound: OutboundTracking,

    messages: Vec<LoggedMessage>,

    pub turn_count: u32,
    pub requires_escalation: bool,
    pub escalation_reason: Option<String>,
    /// Violations from the most recent policy evaluation.
    pub policy_violations: Vec<PolicyViolation>,
    pub incidents: Vec<Incident>,
    pub requires_human_review: bool,
    /// Safe-template substitutions in the current phase.
    pub validation_attempt_count: u32,
    pub legal_notice_acknowledged: bool,
    pub survey_completed: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row of the patient record backing an outbound call.
    pub patient_row: Option<usize>,
}

impl SessionState {
    /// Fresh state for a call that has not exchanged any message yet.
    pub fn new(
        session_id: impl Into<String>,
        direction: CallDirection,
        agent_name: impl Into<String>,
        company_name: impl Into<String>,
        insurer_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: session_id.into(),
            direction,
            current_phase: Phase::initial(direction),
            agent_name: agent_name.into(),
            company_name: company_name.into(),
            insurer_name: insurer_name.into(),
            patient: PatientInfo::default(),
            service: ServiceInfo::default(),
            outbound: OutboundTracking::default(),
            messages: Vec::new(),
            turn_count: 0,
            requires_escalation: false,
            escalation_reason: None,
            policy_violations: Vec::new(),
            incidents: Vec::new(),
            requires_human_review: false,
            validation_attempt_count: 0,
            legal_notice_acknowledged: false,
            survey_completed: false,
            created_at: now,
            updated_at: now,
            patient_row: None,
        }
    }

    // ── Conversation log ────────────────────────────────────────────

    /// The full, ordered conversation log.
    pub fn messages(&self) -> &[LoggedMessage] {
        &self.messages
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.append(Role::User, content.into());
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) {
        self.append(Role::Assistant, content.into());
    }

    fn append(&mut self, role: Role, content: String) {
        self.messages.push(LoggedMessage {
            role,
            content,
            timestamp: Utc::now(),
        });
    }

    /// Content of the most recent caller message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// The trailing `window` messages, oldest first.
    pub fn recent_messages(&self, window: usize) -> &[LoggedMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    // ── Persistence ─────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode a persisted state, rejecting unknown schema versions.
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        let state: Self =
            serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if state.schema_version != SESSION_SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: state.schema_version,
                expected: SESSION_SCHEMA_VERSION,
            });
        }
        Ok(state)
    }

    // ── Extracted data ──────────────────────────────────────────────

    /// Merge model-extracted fields, skipping nulls and blank strings.
    ///
    /// Returns the keys that actually changed something.
    pub fn merge_extracted(&mut self, extracted: &Map<String, Value>) -> Vec<String> {
        let mut merged = Vec::new();
        for (key, value) in extracted {
            if self.merge_field(key, value) {
                merged.push(key.clone());
            }
        }
        merged
    }

    fn merge_field(&mut self, key: &str, value: &Value) -> bool {
        let p = &mut self.patient;
        let s = &mut self.service;
        let o = &mut self.outbound;
        match key {
            "patient_full_name" => set_text(&mut p.full_name, value),
            "document_type" => set_text(&mut p.document_type, value),
            "document_number" => set_text(&mut p.document_number, value),
            "eps" | "insurer" => set_text(&mut p.insurer, value),
            "is_responsible" => set_flag(&mut p.is_responsible, value),
            "responsible_name" => set_text(&mut p.responsible_name, value),
            "contact_name" => set_text(&mut p.contact_name, value),
            "contact_relationship" => set_text(&mut p.contact_relationship, value),
            "contact_age" => match value.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(age) => {
                    p.contact_age = Some(age);
                    true
                }
                None => false,
            },
            "service_type" => set_text(&mut s.service_type, value),
            "treatment_type" => set_text(&mut s.treatment_type, value),
            "frequency" => set_text(&mut s.frequency, value),
            "appointment_date" => set_text(&mut s.appointment_date, value),
            "appointment_time" => set_text(&mut s.appointment_time, value),
            "pickup_address" => set_text(&mut s.pickup_address, value),
            "destination_address" => set_text(&mut s.destination_address, value),
            "service_modality" | "modality" => set_text(&mut s.modality, value),
            "special_observations" => set_text(&mut s.special_observations, value),
            "has_authorization" => set_flag(&mut s.has_authorization, value),
            "service_confirmed" => set_bool(&mut o.service_confirmed, value),
            "confirmation_status" => set_text(&mut o.confirmation_status, value),
            "new_appointment_date" => set_text(&mut o.new_appointment_date, value),
            "patient_away" => set_bool(&mut o.patient_away, value),
            "return_date" => set_text(&mut o.return_date, value),
            "coverage_issue" => set_bool(&mut o.coverage_issue, value),
            "special_needs" => {
                let needs: Vec<String> = match value {
                    Value::Array(items) => items.iter().filter_map(non_empty_text).collect(),
                    other => non_empty_text(other).into_iter().collect(),
                };
                let before = o.special_needs.len();
                for need in needs {
                    if !o.special_needs.contains(&need) {
                        o.special_needs.push(need);
                    }
                }
                o.special_needs.len() != before
            }
            _ => false,
        }
    }
}

/// Text content of a JSON value, if it carries any.
///
/// Numbers are accepted since document numbers and dates often arrive unquoted.
pub fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn set_text(slot: &mut Option<String>, value: &Value) -> bool {
    match non_empty_text(value) {
        Some(text) => {
            *slot = Some(text);
            true
        }
        None => false,
    }
}

fn set_flag(slot: &mut Option<bool>, value: &Value) -> bool {
    match value.as_bool() {
        Some(flag) => {
            *slot = Some(flag);
            true
        }
        None => false,
    }
}

fn set_bool(slot: &mut bool, value: &Value) -> bool {
    match value.as_bool() {
        Some(flag) => {
            *slot = flag;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_state() -> SessionState {
        SessionState::new("s-1", CallDirection::Inbound, "María", "Transformas", "Cosalud")
    }

    #[test]
    fn new_state_starts_in_direction_initial_phase() {
        let inbound = make_state();
        assert_eq!(inbound.current_phase, Phase::Greeting);
        assert_eq!(inbound.turn_count, 0);
        assert!(inbound.messages().is_empty());

        let outbound =
            SessionState::new("s-2", CallDirection::Outbound, "María", "Transformas", "Cosalud");
        assert_eq!(outbound.current_phase, Phase::OutboundGreeting);
    }

    #[test]
    fn round_trip_preserves_message_order() {
        let mut state = make_state();
        state.append_user("Hola");
        state.append_assistant("Buenos días, ¿con quién hablo?");
        state.append_user("Con Ana Pérez");
        state.patient.insurer = Some("Cosalud".into());

        let raw = state.to_json().unwrap();
        let back = SessionState::from_json(&raw).unwrap();

        assert_eq!(back, state);
        let contents: Vec<&str> = back.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["Hola", "Buenos días, ¿con quién hablo?", "Con Ana Pérez"]);
    }

    #[test]
    fn from_json_rejects_other_schema_versions() {
        let mut state = make_state();
        state.schema_version = 99;
        let raw = serde_json::to_string(&state).unwrap();
        match SessionState::from_json(&raw) {
            Err(StoreError::SchemaVersion { found: 99, .. }) => {}
            other => panic!("Expected SchemaVersion error, got {:?}", other),
        }
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let mut state = make_state();
        assert!(state.last_user_message().is_none());
        state.append_user("primero");
        state.append_assistant("respuesta");
        assert_eq!(state.last_user_message(), Some("primero"));
    }

    #[test]
    fn recent_messages_is_a_tail_window() {
        let mut state = make_state();
        for i in 0..5 {
            state.append_user(format!("m{i}"));
        }
        let tail: Vec<&str> = state.recent_messages(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, ["m3", "m4"]);
        assert_eq!(state.recent_messages(50).len(), 5);
    }

    #[test]
    fn merge_skips_empty_values() {
        let mut state = make_state();
        state.patient.full_name = Some("Ana Pérez".into());

        let extracted = json!({
            "patient_full_name": "",
            "document_number": 123456,
            "pickup_address": "   ",
            "appointment_time": null,
            "eps": "Cosalud",
            "unknown_key": "ignored"
        });
        let merged = state.merge_extracted(extracted.as_object().unwrap());

        assert_eq!(state.patient.full_name.as_deref(), Some("Ana Pérez"));
        assert_eq!(state.patient.document_number.as_deref(), Some("123456"));
        assert_eq!(state.patient.insurer.as_deref(), Some("Cosalud"));
        assert!(state.service.pickup_address.is_none());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_outbound_fields() {
        let mut state = make_state();
        let extracted = json!({
            "service_confirmed": true,
            "special_needs": ["silla de ruedas", "", "silla de ruedas"],
            "contact_age": 15
        });
        state.merge_extracted(extracted.as_object().unwrap());
        assert!(state.outbound.service_confirmed);
        assert_eq!(state.outbound.special_needs, vec!["silla de ruedas"]);
        assert_eq!(state.patient.contact_age, Some(15));
    }
}
