//! Call orchestrator: session lifecycle and per-turn entry point.
//!
//! Owns the store, the patient directory and the turn pipeline. Each turn is a
//! load → run pipeline → persist cycle, serialized per session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Timelike;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::OrchestratorError;
use crate::llm::ReplyClient;
use crate::patients::{PatientDirectory, normalize_phone};
use crate::phase::{CallDirection, Phase};
use crate::pipeline::prompts::outbound_greeting;
use crate::pipeline::{TurnContext, TurnMetadata, TurnPipeline};
use crate::policy::PolicyEngine;
use crate::session::SessionState;
use crate::store::SessionStore;

/// What the caller gets back for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub agent_reply: String,
    pub phase: Phase,
    pub escalation_flag: bool,
    pub escalation_reason: Option<String>,
    /// Non-empty fields the model extracted this turn.
    pub extracted_fields: Map<String, Value>,
    pub requires_human_review: bool,
    pub call_ended: bool,
    pub metadata: TurnMetadata,
}

impl TurnResponse {
    fn new(
        state: &SessionState,
        agent_reply: String,
        extracted_fields: Map<String, Value>,
        metadata: TurnMetadata,
    ) -> Self {
        Self {
            session_id: state.session_id.clone(),
            agent_reply,
            phase: state.current_phase,
            escalation_flag: state.requires_escalation,
            escalation_reason: state.escalation_reason.clone(),
            extracted_fields,
            requires_human_review: state.requires_human_review,
            call_ended: state.current_phase.is_terminal(),
            metadata,
        }
    }
}

type SessionLock = Arc<Mutex<()>>;

/// Entry point for calls.
pub struct Orchestrator {
    config: Arc<AgentConfig>,
    store: Arc<dyn SessionStore>,
    patients: Option<Arc<dyn PatientDirectory>>,
    pipeline: TurnPipeline,
    locks: Mutex<HashMap<String, SessionLock>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn SessionStore>,
        llm: ReplyClient,
        patients: Option<Arc<dyn PatientDirectory>>,
    ) -> Self {
        let pipeline = TurnPipeline::new(Arc::clone(&config), llm, patients.clone());
        Self {
            config,
            store,
            patients,
            pipeline,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the policy set used by the pipeline.
    pub fn with_policies(mut self, policies: Arc<PolicyEngine>) -> Self {
        self.pipeline = self.pipeline.with_policies(policies);
        self
    }

    /// The mutex guarding one key. Idle entries are pruned on the way.
    async fn lock_for(&self, key: &str) -> SessionLock {
        let mut locks = self.locks.lock().await;
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Start a call. Outbound calls load the patient scheduled for `phone`.
    pub async fn create_session(
        &self,
        direction: CallDirection,
        agent_name: Option<&str>,
        phone: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let session_id = Uuid::new_v4().to_string();
        let agent_name = agent_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.config.agent_name);

        let mut state = SessionState::new(
            &session_id,
            direction,
            agent_name,
            &self.config.company_name,
            &self.config.insurer_name,
        );

        match direction {
            CallDirection::Outbound => {
                let patients = self
                    .patients
                    .as_ref()
                    .ok_or(OrchestratorError::PatientDirectoryUnavailable)?;
                let phone = phone.ok_or_else(|| {
                    OrchestratorError::InvalidRequest("outbound calls need a phone number".into())
                })?;
                let record = patients
                    .get_patient_by_phone(phone)
                    .await?
                    .ok_or_else(|| OrchestratorError::PatientNotFound(phone.to_string()))?;
                record.apply_to(&mut state);
            }
            CallDirection::Inbound => {
                state.patient.phone = phone.and_then(normalize_phone);
            }
        }

        self.store
            .set(&session_id, &state, self.config.session_ttl)
            .await?;
        info!(
            session_id = %session_id,
            direction = %direction,
            patient_row = ?state.patient_row,
            "Session created"
        );
        Ok(session_id)
    }

    /// Live session for a phone number, if any.
    pub async fn find_session_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let Some(normalized) = normalize_phone(phone) else {
            return Ok(None);
        };
        Ok(self.store.find_by_phone(&normalized).await?)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionState, OrchestratorError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;
        if !self.store.delete(session_id).await? {
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        }
        self.locks.lock().await.remove(session_id);
        info!(session_id = %session_id, "Session deleted");
        Ok(())
    }

    // ── Turns ───────────────────────────────────────────────────────

    /// Process one caller message.
    pub async fn process_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<TurnResponse, OrchestratorError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut state = self.get_session(session_id).await?;
        if state.current_phase.is_terminal() {
            return Err(OrchestratorError::CallEnded(session_id.to_string()));
        }

        if self.is_start_sentinel(&state, text) {
            return self.open_outbound_call(state).await;
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::InvalidRequest("empty message".into()));
        }

        state.append_user(text);
        let ctx = self.pipeline.run(TurnContext::new(state, text)).await?;

        let TurnContext {
            mut state,
            agent_response,
            extracted,
            metadata,
            ..
        } = ctx;
        state.append_assistant(agent_response.clone());
        self.store
            .set(session_id, &state, self.config.session_ttl)
            .await?;

        Ok(TurnResponse::new(&state, agent_response, extracted, metadata))
    }

    /// Find or create the session for `phone`, then process `text`.
    pub async fn process_by_phone(
        &self,
        phone: &str,
        text: &str,
        direction: CallDirection,
        agent_name: Option<&str>,
    ) -> Result<TurnResponse, OrchestratorError> {
        let normalized = normalize_phone(phone)
            .ok_or_else(|| OrchestratorError::InvalidRequest(format!("invalid phone: {phone}")))?;

        let session_id = {
            let lock = self.lock_for(&format!("phone:{normalized}")).await;
            let _guard = lock.lock().await;
            let live = match self.store.find_by_phone(&normalized).await? {
                Some(id) => self
                    .store
                    .get(&id)
                    .await?
                    .filter(|state| !state.current_phase.is_terminal()),
                None => None,
            };
            match live {
                Some(state) => {
                    debug!(session_id = %state.session_id, "Resuming session for phone");
                    state.session_id
                }
                // No call yet, or the last one has ended: start a new one.
                None => {
                    self.create_session(direction, agent_name, Some(&normalized))
                        .await?
                }
            }
        };

        self.process_message(&session_id, text).await
    }

    fn is_start_sentinel(&self, state: &SessionState, text: &str) -> bool {
        state.direction == CallDirection::Outbound
            && state.turn_count == 0
            && text.trim().eq_ignore_ascii_case(&self.config.start_sentinel)
    }

    /// First turn of an outbound call: greet from the record, no model call.
    async fn open_outbound_call(
        &self,
        mut state: SessionState,
    ) -> Result<TurnResponse, OrchestratorError> {
        let now = self.pipeline.local_now();
        let greeting = outbound_greeting(&state, now.hour(), now.date_naive());

        state.turn_count = 1;
        state.append_assistant(greeting.clone());
        state.updated_at = chrono::Utc::now();
        self.store
            .set(&state.session_id, &state, self.config.session_ttl)
            .await?;

        info!(session_id = %state.session_id, "Outbound call opened");
        Ok(TurnResponse::new(
            &state,
            greeting,
            Map::new(),
            TurnMetadata::default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::patients::{InMemoryPatientDirectory, PatientRecord};
    use crate::store::InMemorySessionStore;

    /// Mock LLM that always stays in the current greeting phase.
    struct EchoLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, _: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                content: r#"{"agent_response": "Claro, cuénteme.", "next_phase": "GREETING", "requires_escalation": false, "escalation_reason": null, "extracted": {}}"#.into(),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn make_orchestrator(
        patients: Option<Arc<dyn PatientDirectory>>,
    ) -> (Orchestrator, Arc<EchoLlm>) {
        let llm = Arc::new(EchoLlm {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            Arc::new(AgentConfig::default()),
            InMemorySessionStore::new(),
            ReplyClient::new(llm.clone(), 0.3, 500),
            patients,
        );
        (orchestrator, llm)
    }

    fn directory() -> Arc<dyn PatientDirectory> {
        Arc::new(InMemoryPatientDirectory::new(vec![PatientRecord {
            first_name: "Carmen".into(),
            last_name: "Gamero".into(),
            phone: "573001234567".into(),
            service_type: "Terapia".into(),
            appointment_date: "2025-10-21".into(),
            appointment_time: "07:00".into(),
            ..Default::default()
        }]))
    }

    #[tokio::test]
    async fn outbound_requires_directory_and_known_patient() {
        let (orchestrator, _) = make_orchestrator(None);
        let err = orchestrator
            .create_session(CallDirection::Outbound, None, Some("3001234567"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PatientDirectoryUnavailable));

        let (orchestrator, _) = make_orchestrator(Some(directory()));
        let err = orchestrator
            .create_session(CallDirection::Outbound, None, Some("3009999999"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PatientNotFound(_)));
    }

    #[tokio::test]
    async fn sentinel_opens_outbound_call_without_model() {
        let (orchestrator, llm) = make_orchestrator(Some(directory()));
        let id = orchestrator
            .create_session(CallDirection::Outbound, None, Some("300 123 4567"))
            .await
            .unwrap();

        let response = orchestrator.process_message(&id, "start").await.unwrap();

        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.phase, Phase::OutboundGreeting);
        assert!(response.agent_reply.contains("Carmen Gamero"));

        let state = orchestrator.get_session(&id).await.unwrap();
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.messages().len(), 1);
    }

    #[tokio::test]
    async fn turn_appends_both_messages() {
        let (orchestrator, llm) = make_orchestrator(None);
        let id = orchestrator
            .create_session(CallDirection::Inbound, Some("Lucía"), None)
            .await
            .unwrap();

        let response = orchestrator.process_message(&id, "Hola").await.unwrap();
        assert_eq!(response.agent_reply, "Claro, cuénteme.");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

        let state = orchestrator.get_session(&id).await.unwrap();
        assert_eq!(state.agent_name, "Lucía");
        assert_eq!(state.turn_count, 1);
        let roles: Vec<_> = state.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, [crate::llm::Role::User, crate::llm::Role::Assistant]);
    }

    #[tokio::test]
    async fn unknown_and_deleted_sessions() {
        let (orchestrator, _) = make_orchestrator(None);
        assert!(matches!(
            orchestrator.process_message("missing", "Hola").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));

        let id = orchestrator
            .create_session(CallDirection::Inbound, None, None)
            .await
            .unwrap();
        orchestrator.delete_session(&id).await.unwrap();
        assert!(matches!(
            orchestrator.delete_session(&id).await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn process_by_phone_reuses_session() {
        let (orchestrator, _) = make_orchestrator(None);
        let first = orchestrator
            .process_by_phone("+57 300 555 1234", "Hola", CallDirection::Inbound, None)
            .await
            .unwrap();
        let second = orchestrator
            .process_by_phone("3005551234", "Sigo aquí", CallDirection::Inbound, None)
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(
            orchestrator.find_session_by_phone("3005551234").await.unwrap(),
            Some(first.session_id.clone())
        );

        let state = orchestrator.get_session(&first.session_id).await.unwrap();
        assert_eq!(state.turn_count, 2);
    }

    #[tokio::test]
    async fn blank_message_rejected() {
        let (orchestrator, _) = make_orchestrator(None);
        let id = orchestrator
            .create_session(CallDirection::Inbound, None, None)
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.process_message(&id, "   ").await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }
}
