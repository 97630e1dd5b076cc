//! Turn processor: runs one caller message through the stage graph.
//!
//! Flow per turn:
//! 1. Rule-based analysis and policy evaluation (no model)
//! 2. Escalation gate, which may answer without calling the model
//! 3. At most one model call, then validation and state updates
//!
//! The model is never trusted with phase control: every proposal goes through
//! [`Phase::resolve`](crate::phase::Phase::resolve).

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::PipelineError;
use crate::escalation::{EscalationInput, EscalationRules, IncidentType};
use crate::llm::{ChatMessage, ReplyClient};
use crate::patients::{CallStatus, PatientDirectory};
use crate::phase::{CallDirection, Phase};
use crate::pipeline::graph::{MAX_STEPS, Node};
use crate::pipeline::prompts::{self, contact_may_be_minor, contact_may_be_minor_with};
use crate::pipeline::rules::{ContextEnricher, IntentClassifier};
use crate::pipeline::types::{Intent, PhaseAnomaly, SpecialCase, Topic, TurnContext};
use crate::pipeline::validator::ResponseValidator;
use crate::policy::PolicyEngine;
use crate::session::{Incident, SessionState, non_empty_text};

/// Spoken when the model call fails, times out or returns garbage.
pub const LLM_FALLBACK_REPLY: &str = "Disculpe, hubo un problema técnico. ¿Puede repetir, por favor?";

const WRONG_NUMBER_REPLY: &str = "Disculpe la molestia, parece que este número no corresponde \
                                  al paciente. Actualizaremos nuestros registros. Que tenga un buen día.";

const PATIENT_DECEASED_REPLY: &str = "Lamento mucho su pérdida. Actualizaremos la información \
                                      del paciente. Le acompañamos en este momento.";

/// Runs the stage graph for one turn.
pub struct TurnPipeline {
    config: Arc<AgentConfig>,
    classifier: IntentClassifier,
    enricher: ContextEnricher,
    policies: Arc<PolicyEngine>,
    escalation: EscalationRules,
    validator: ResponseValidator,
    llm: ReplyClient,
    patients: Option<Arc<dyn PatientDirectory>>,
}

impl TurnPipeline {
    pub fn new(
        config: Arc<AgentConfig>,
        llm: ReplyClient,
        patients: Option<Arc<dyn PatientDirectory>>,
    ) -> Self {
        Self {
            classifier: IntentClassifier::new(),
            enricher: ContextEnricher,
            policies: Arc::new(PolicyEngine::from_config(&config)),
            escalation: EscalationRules::from_config(&config),
            validator: ResponseValidator,
            llm,
            patients,
            config,
        }
    }

    /// Replace the policy set.
    pub fn with_policies(mut self, policies: Arc<PolicyEngine>) -> Self {
        self.policies = policies;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current time in the call center's timezone.
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.config.local_offset())
    }

    /// Run the graph from the start node until an edge ends it.
    pub async fn run(&self, mut ctx: TurnContext) -> Result<TurnContext, PipelineError> {
        let session_id = ctx.state.session_id.clone();
        let mut next = Some(Node::START);
        let mut steps = 0;

        while let Some(node) = next {
            steps += 1;
            if steps > MAX_STEPS {
                return Err(PipelineError::Runaway { steps });
            }
            debug!(session_id = %session_id, stage = node.name(), "Running stage");
            ctx.metadata.stages.push(node.name().to_string());
            self.run_node(node, &mut ctx).await?;
            next = node.edge().next(&ctx);
        }

        ctx.validate_exit()?;
        info!(
            session_id = %session_id,
            phase = %ctx.state.current_phase,
            turn = ctx.state.turn_count,
            stages = ctx.metadata.stages.len(),
            escalated = ctx.escalation.escalate,
            "Turn processed"
        );
        Ok(ctx)
    }

    async fn run_node(&self, node: Node, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        match node {
            Node::InputProcessor => self.input_processor(ctx),
            Node::IntentClassifier => self.intent_classifier(ctx),
            Node::ContextEnricher => self.context_enricher(ctx),
            Node::PolicyEngine => self.policy_engine(ctx),
            Node::EligibilityChecker => self.eligibility_checker(ctx),
            Node::EscalationDetector => self.escalation_detector(ctx),
            Node::SpecialCaseHandler => self.special_case_handler(ctx),
            Node::ContextBuilder => self.context_builder(ctx),
            Node::LanguageModelCall => self.language_model_call(ctx).await,
            Node::ResponseValidator => self.response_validator(ctx),
            Node::ResponseProcessor => self.response_processor(ctx),
            Node::DataSinkWriter => self.data_sink_writer(ctx).await,
            Node::StateUpdater => self.state_updater(ctx),
        }
    }

    // ── Pre-model stages ────────────────────────────────────────────

    fn input_processor(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        ctx.validate_entry()?;
        ctx.state.turn_count += 1;
        ctx.state.updated_at = Utc::now();
        Ok(())
    }

    fn intent_classifier(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        ctx.analysis = self.classifier.analyze(&ctx.input);
        Ok(())
    }

    fn context_enricher(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        ctx.enrichment = self.enricher.enrich(&ctx.analysis, &mut ctx.state);
        Ok(())
    }

    fn policy_engine(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let evaluation =
            self.policies
                .evaluate(&ctx.state, ctx.state.current_phase, ctx.state.direction);
        ctx.state.policy_violations = evaluation.violations.clone();
        ctx.metadata.policy_violations = evaluation
            .violations
            .iter()
            .map(|v| v.policy_id.clone())
            .collect();
        if !evaluation.violations.is_empty() {
            info!(
                session_id = %ctx.state.session_id,
                violations = ?ctx.metadata.policy_violations,
                blocking = evaluation.has_blocking(),
                "Policy violations detected"
            );
        }
        ctx.policy = evaluation;
        Ok(())
    }

    fn eligibility_checker(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let mut issues = Vec::new();
        let accepted = self.config.insurer_name.trim().to_lowercase();

        if let Some(insurer) = ctx.state.patient.insurer.as_deref()
            && !insurer.trim().is_empty()
            && !insurer.to_lowercase().contains(&accepted)
        {
            issues.push(format!(
                "EPS {} no válida, solo {}",
                insurer.trim(),
                self.config.insurer_name
            ));
        }

        if let Some(dates) = ctx.state.service.appointment_date.as_deref()
            && dates.contains(',')
            && dates.split(',').any(|d| d.trim().is_empty())
        {
            issues.push("Fechas de cita inválidas".to_string());
        }

        ctx.eligibility_issues = issues;
        Ok(())
    }

    fn escalation_detector(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let state = &ctx.state;
        let mut reasons: Vec<String> = ctx
            .policy
            .blocking()
            .map(|v| format!("Política bloqueante: {}", v.policy_name))
            .collect();

        // Once the call has been handed off, only policies can escalate again.
        // A hand-off that could not move the phase still counts.
        let handed_off = state.requires_human_review
            || (state.requires_escalation
                && matches!(
                    state.current_phase,
                    Phase::Escalation
                        | Phase::Closing
                        | Phase::Survey
                        | Phase::OutboundSpecialCases
                        | Phase::OutboundClosing
                ));

        if !handed_off {
            reasons.extend(ctx.eligibility_issues.iter().cloned());

            let express_requested = state
                .service
                .modality
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains("expres"));
            let input = EscalationInput {
                incident_type: ctx.analysis.incident_type,
                pickup_address: state.service.pickup_address.as_deref(),
                destination_address: state.service.destination_address.as_deref(),
                express_requested,
                has_authorization: state.service.has_authorization,
                user_message: Some(ctx.input.as_str()),
            };
            reasons.extend(self.escalation.check_escalation_needed(&input).reasons);

            if state.turn_count > self.config.max_turns {
                reasons.push(format!(
                    "Se superó el máximo de {} turnos",
                    self.config.max_turns
                ));
            }
        }

        reasons.dedup();
        ctx.escalation.escalate = !reasons.is_empty();
        ctx.escalation.reasons = reasons;

        if ctx.escalation.escalate {
            let reason = ctx.escalation.reason_text();
            warn!(
                session_id = %ctx.state.session_id,
                phase = %ctx.state.current_phase,
                reason = %reason,
                "Escalation required"
            );
            ctx.special_case = Some(SpecialCase::Escalation);
            ctx.state.requires_escalation = true;
            ctx.state.escalation_reason = Some(reason);
        }
        Ok(())
    }

    fn special_case_handler(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let case = ctx.special_case.unwrap_or(SpecialCase::Escalation);
        info!(
            session_id = %ctx.state.session_id,
            phase = %ctx.state.current_phase,
            case = ?case,
            "Handling special case"
        );

        match case {
            SpecialCase::Escalation => {
                let proposed = match ctx.state.direction {
                    CallDirection::Inbound => Phase::Escalation,
                    CallDirection::Outbound => Phase::OutboundSpecialCases,
                };
                ctx.agent_response = self.escalation.instructions(&ctx.escalation.reasons);
                if ctx.apply_phase(proposed) != proposed {
                    debug!(
                        session_id = %ctx.state.session_id,
                        proposed = %proposed,
                        "Hand-off phase not reachable yet; call stays flagged for review"
                    );
                }
            }
            SpecialCase::WrongNumber | SpecialCase::PatientDeceased => {
                ctx.agent_response = match case {
                    SpecialCase::WrongNumber => WRONG_NUMBER_REPLY,
                    _ => PATIENT_DECEASED_REPLY,
                }
                .to_string();
                // Nothing left to talk about: walk the legal steps to the end.
                let route = ctx.state.current_phase.route_to(Phase::End).unwrap_or_default();
                for step in route {
                    ctx.apply_phase(step);
                }
            }
        }

        ctx.special_case = Some(case);
        ctx.metadata.special_case = Some(case);
        ctx.state.requires_human_review = true;
        ctx.state.updated_at = Utc::now();
        Ok(())
    }

    // ── Model stages ────────────────────────────────────────────────

    fn context_builder(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let now = self.local_now();
        let system = prompts::system_prompt(
            &ctx.state,
            &ctx.policy,
            &ctx.enrichment,
            now.hour(),
            now.date_naive(),
        );

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(
            ctx.state
                .recent_messages(self.config.history_window)
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.content.clone(),
                }),
        );
        ctx.prompt = messages;
        Ok(())
    }

    async fn language_model_call(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        if ctx.escalation.escalate || ctx.metadata.llm_calls > 0 {
            return Err(PipelineError::InvalidContext {
                stage: Node::LanguageModelCall.name().to_string(),
                reason: "model call not allowed on this path".to_string(),
            });
        }
        ctx.metadata.llm_calls += 1;

        let timeout = self.config.llm_timeout;
        let outcome = tokio::time::timeout(timeout, self.llm.respond(ctx.prompt.clone())).await;
        let error = match outcome {
            Ok(Ok(reply)) => {
                ctx.agent_response = reply.agent_response.clone();
                ctx.reply = Some(reply);
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("model call timed out after {}s", timeout.as_secs_f32()),
        };

        warn!(
            session_id = %ctx.state.session_id,
            model = %self.llm.model_name(),
            error = %error,
            "Model call failed, using fallback reply"
        );
        ctx.metadata.llm_parse_error = true;
        ctx.metadata.llm_error = Some(error);
        ctx.agent_response = LLM_FALLBACK_REPLY.to_string();
        Ok(())
    }

    fn response_validator(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        // The reply may reveal a minor on the line in this very turn.
        let minor_contact = match &ctx.reply {
            Some(reply) => contact_may_be_minor_with(&ctx.state, &reply.extracted),
            None => contact_may_be_minor(&ctx.state),
        };
        let outcome = self.validator.validate(
            &ctx.agent_response,
            minor_contact,
            &ctx.analysis,
            &ctx.state.policy_violations,
            self.local_now().hour(),
        );
        if outcome.fallback {
            ctx.state.validation_attempt_count += 1;
        }
        ctx.agent_response = outcome.text;
        ctx.metadata.corrections = outcome.corrections;
        ctx.metadata.warnings = outcome.warnings;
        ctx.metadata.validation_fallback = outcome.fallback;
        Ok(())
    }

    fn response_processor(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        let Some(reply) = ctx.reply.clone() else {
            // Fallback path: nothing to merge, phase stays put.
            return Ok(());
        };

        ctx.extracted = accepted_fields(&reply.extracted);
        let merged = ctx.state.merge_extracted(&ctx.extracted);
        if !merged.is_empty() {
            debug!(session_id = %ctx.state.session_id, fields = ?merged, "Extracted fields merged");
        }

        self.record_incidents(ctx);

        let flag = |key: &str| ctx.extracted.get(key).and_then(Value::as_bool) == Some(true);
        let (deceased, wrong_number, acknowledged) = (
            flag("patient_deceased"),
            flag("wrong_number"),
            flag("legal_notice_acknowledged"),
        );
        if deceased {
            ctx.special_case = Some(SpecialCase::PatientDeceased);
        } else if wrong_number {
            ctx.special_case = Some(SpecialCase::WrongNumber);
        }
        if acknowledged {
            ctx.state.legal_notice_acknowledged = true;
        }

        let current = ctx.state.current_phase;
        let mut proposed = reply.next_phase;

        // The model tends to repeat the legal notice after the caller accepted it.
        if current == Phase::OutboundLegalNotice
            && proposed == current
            && (ctx.state.legal_notice_acknowledged
                || ctx.analysis.intents.contains(&Intent::Confirm))
        {
            debug!(session_id = %ctx.state.session_id, "Moving past acknowledged legal notice");
            proposed = Phase::OutboundServiceConfirmation;
        }

        if !current.can_transition_to(proposed) {
            warn!(
                session_id = %ctx.state.session_id,
                current = %current,
                proposed = %proposed,
                "Model proposed an unreachable phase; staying put"
            );
            ctx.metadata.phase_anomaly = Some(PhaseAnomaly { current, proposed });
        }
        let next = ctx.apply_phase(proposed);

        if next != current {
            if matches!(current, Phase::LegalNotice | Phase::OutboundLegalNotice) {
                ctx.state.legal_notice_acknowledged = true;
            }
            if current == Phase::Survey {
                ctx.state.survey_completed = true;
            }
            info!(
                session_id = %ctx.state.session_id,
                from = %current,
                to = %next,
                "Phase changed"
            );
        }
        if ctx.extracted.contains_key("survey_rating") {
            ctx.state.survey_completed = true;
        }
        Ok(())
    }

    fn record_incidents(&self, ctx: &mut TurnContext) {
        let summary = ctx.extracted.get("incident_summary").and_then(non_empty_text);
        let incident = match summary {
            Some(summary) => {
                let kind = ctx
                    .extracted
                    .get("incident_type")
                    .and_then(Value::as_str)
                    .map(IncidentType::from_label)
                    .filter(|k| *k != IncidentType::Other)
                    .unwrap_or_else(|| IncidentType::classify(&summary));
                Some(Incident {
                    summary,
                    kind,
                    recorded_at: Utc::now(),
                })
            }
            // A complaint about the driver the model did not summarize.
            None if ctx.analysis.intents.contains(&Intent::Complaint)
                && ctx.analysis.topics.contains(&Topic::Driver) =>
            {
                Some(Incident {
                    summary: ctx.input.clone(),
                    kind: ctx
                        .analysis
                        .incident_type
                        .unwrap_or(IncidentType::DriverComplaint),
                    recorded_at: Utc::now(),
                })
            }
            None => None,
        };

        if let Some(incident) = incident {
            info!(
                session_id = %ctx.state.session_id,
                kind = ?incident.kind,
                severity = ?incident.kind.severity(),
                "Incident recorded"
            );
            ctx.state.incidents.push(incident);
        }
    }

    // ── Terminal stages ─────────────────────────────────────────────

    async fn data_sink_writer(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        record_model_escalation(ctx);

        let (Some(patients), Some(row)) = (&self.patients, ctx.state.patient_row) else {
            return Ok(());
        };
        if ctx.state.direction != CallDirection::Outbound {
            return Ok(());
        }

        let (status, observations) = match ctx.special_case.and_then(SpecialCase::observation) {
            Some(note) => (
                CallStatus::Rejected,
                format!("{} - {note}", call_observations(&ctx.state)),
            ),
            None => (call_status(&ctx.state), call_observations(&ctx.state)),
        };
        match patients.update_call_status(row, status, &observations).await {
            Ok(()) => {
                ctx.metadata.data_sink_written = true;
                info!(
                    session_id = %ctx.state.session_id,
                    row,
                    status = %status,
                    "Call outcome written"
                );
            }
            Err(e) => {
                warn!(
                    session_id = %ctx.state.session_id,
                    row,
                    error = %e,
                    "Failed to write call outcome"
                );
            }
        }
        Ok(())
    }

    fn state_updater(&self, ctx: &mut TurnContext) -> Result<(), PipelineError> {
        record_model_escalation(ctx);
        Ok(())
    }
}

/// Keep only extracted values that carry data.
fn accepted_fields(extracted: &Map<String, Value>) -> Map<String, Value> {
    extracted
        .iter()
        .filter(|(_, v)| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            _ => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Carry the model's own escalation flag into the session.
fn record_model_escalation(ctx: &mut TurnContext) {
    if let Some(reply) = &ctx.reply
        && reply.requires_escalation
    {
        ctx.state.requires_escalation = true;
        ctx.state.escalation_reason = reply
            .escalation_reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| ctx.state.escalation_reason.clone())
            .or_else(|| Some("Escalamiento solicitado por el agente".to_string()));
    }
    ctx.state.updated_at = Utc::now();
}

/// Status to write back for a finished outbound call.
pub fn call_status(state: &SessionState) -> CallStatus {
    let outbound = &state.outbound;
    if outbound.coverage_issue {
        return CallStatus::NoCoverage;
    }
    if let Some(label) = outbound.confirmation_status.as_deref() {
        let status = CallStatus::from_label(label);
        if status != CallStatus::Pending {
            return status;
        }
    }
    if outbound.new_appointment_date.is_some() {
        CallStatus::Reschedule
    } else if outbound.service_confirmed {
        CallStatus::Confirmed
    } else {
        CallStatus::Pending
    }
}

/// Observation line for a finished outbound call.
pub fn call_observations(state: &SessionState) -> String {
    let outbound = &state.outbound;
    let mut parts = vec!["Llamada completada".to_string()];
    if outbound.service_confirmed {
        parts.push("Servicio confirmado".to_string());
    }
    if let Some(date) = &outbound.new_appointment_date {
        parts.push(format!("Fecha reprogramada: {date}"));
    }
    if outbound.patient_away {
        match &outbound.return_date {
            Some(date) => parts.push(format!("Paciente fuera de la ciudad hasta {date}")),
            None => parts.push("Paciente fuera de la ciudad".to_string()),
        }
    }
    if !outbound.special_needs.is_empty() {
        parts.push(format!(
            "Necesidades especiales: {}",
            outbound.special_needs.join(", ")
        ));
    }
    if outbound.coverage_issue {
        parts.push("Zona sin cobertura".to_string());
    }
    for incident in &state.incidents {
        parts.push(format!(
            "Incidencia ({}): {}",
            incident.kind.display_name(),
            incident.summary
        ));
    }
    if let Some(reason) = state.escalation_reason.as_deref().filter(|_| state.requires_escalation) {
        parts.push(format!("Escalado: {reason}"));
    }
    parts.join(" - ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::patients::{InMemoryPatientDirectory, PatientRecord};
    use crate::pipeline::validator::MINOR_CONTACT_FALLBACK;

    /// Mock LLM that returns queued replies and records requests.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().await.push(request);
            let content = self.replies.lock().await.pop().ok_or_else(|| LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "no reply queued".into(),
            })?;
            Ok(CompletionResponse {
                content,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    /// Mock LLM that never answers in time.
    struct SlowLlm;

    #[async_trait]
    impl LlmProvider for SlowLlm {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(LlmError::Timeout {
                provider: "slow".into(),
                timeout: Duration::from_secs(5),
            })
        }
    }

    fn reply(text: &str, next: &str, extracted: &str) -> String {
        format!(
            r#"{{"agent_response": "{text}", "next_phase": "{next}", "requires_escalation": false, "escalation_reason": null, "extracted": {extracted}}}"#
        )
    }

    fn pipeline(llm: Arc<dyn LlmProvider>) -> TurnPipeline {
        TurnPipeline::new(
            Arc::new(AgentConfig::default()),
            ReplyClient::new(llm, 0.3, 500),
            None,
        )
    }

    fn context(direction: CallDirection, phase: Phase, input: &str) -> TurnContext {
        let mut state = SessionState::new("s-1", direction, "María", "Transformas", "Cosalud");
        state.current_phase = phase;
        state.append_user(input);
        TurnContext::new(state, input)
    }

    /// Carry a finished turn into the caller's next message.
    fn next_turn(done: TurnContext, input: &str) -> TurnContext {
        let TurnContext {
            mut state,
            agent_response,
            ..
        } = done;
        state.append_assistant(agent_response);
        state.append_user(input);
        TurnContext::new(state, input)
    }

    #[tokio::test]
    async fn greeting_advances_to_identification() {
        let llm = ScriptedLlm::new(&[&reply(
            "Buenos días, le habla María de Transformas. ¿Con quién tengo el gusto?",
            "IDENTIFICATION",
            "{}",
        )]);
        let ctx = pipeline(llm.clone())
            .run(context(CallDirection::Inbound, Phase::Greeting, "Hola"))
            .await
            .unwrap();

        assert_eq!(ctx.state.current_phase, Phase::Identification);
        assert_eq!(ctx.state.turn_count, 1);
        assert!(!ctx.state.requires_escalation);
        assert_eq!(ctx.metadata.llm_calls, 1);
        assert_eq!(ctx.metadata.stages.last().map(String::as_str), Some("state_updater"));

        let requests = llm.requests.lock().await;
        let system = &requests[0].messages[0].content;
        assert!(system.contains("PROTOCOLO"));
        assert_eq!(requests[0].messages.last().map(|m| m.content.as_str()), Some("Hola"));
    }

    #[tokio::test]
    async fn blocking_policy_escalates_without_model_call() {
        let llm = ScriptedLlm::new(&[]);
        let mut ctx = context(CallDirection::Inbound, Phase::Identification, "Mi EPS es Sanitas");
        ctx.state.patient.full_name = Some("Ana Pérez".into());

        let ctx = pipeline(llm.clone()).run(ctx).await.unwrap();

        assert!(llm.requests.lock().await.is_empty());
        assert_eq!(ctx.metadata.llm_calls, 0);
        assert!(ctx.escalation.escalate);
        assert!(ctx.state.requires_escalation);
        assert!(ctx.state.requires_human_review);
        assert_eq!(ctx.state.current_phase, Phase::Escalation);
        assert_eq!(ctx.metadata.policy_violations, vec!["INSURER_001"]);
        assert!(ctx.agent_response.contains("018000-123456"));
    }

    #[tokio::test]
    async fn failed_model_keeps_phase() {
        let llm = ScriptedLlm::new(&["esto no es json"]);
        let ctx = pipeline(llm)
            .run(context(CallDirection::Inbound, Phase::LegalNotice, "Sí, de acuerdo"))
            .await
            .unwrap();

        assert_eq!(ctx.agent_response, LLM_FALLBACK_REPLY);
        assert_eq!(ctx.state.current_phase, Phase::LegalNotice);
        assert!(ctx.metadata.llm_parse_error);
        assert!(ctx.metadata.llm_error.is_some());
    }

    #[tokio::test]
    async fn slow_model_times_out_to_fallback() {
        let config = AgentConfig {
            llm_timeout: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let pipeline = TurnPipeline::new(
            Arc::new(config),
            ReplyClient::new(Arc::new(SlowLlm), 0.3, 500),
            None,
        );
        let ctx = pipeline
            .run(context(CallDirection::Inbound, Phase::Greeting, "Hola"))
            .await
            .unwrap();
        assert_eq!(ctx.agent_response, LLM_FALLBACK_REPLY);
        assert!(ctx.metadata.llm_parse_error);
        assert!(ctx.metadata.llm_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unreachable_proposal_is_clamped_and_reported() {
        let llm = ScriptedLlm::new(&[&reply("Listo, hasta luego.", "END", "{}")]);
        let ctx = pipeline(llm)
            .run(context(CallDirection::Inbound, Phase::Greeting, "Hola"))
            .await
            .unwrap();

        assert_eq!(ctx.state.current_phase, Phase::Greeting);
        assert_eq!(
            ctx.metadata.phase_anomaly,
            Some(PhaseAnomaly {
                current: Phase::Greeting,
                proposed: Phase::End
            })
        );
    }

    #[tokio::test]
    async fn extracted_fields_merge_and_reset_attempts() {
        let llm = ScriptedLlm::new(&[&reply(
            "Perfecto, señora Ana. Le informo que la llamada es grabada.",
            "LEGAL_NOTICE",
            r#"{"patient_full_name": "Ana Pérez", "document_number": "52123456", "eps": "Cosalud", "pickup_address": null, "appointment_time": ""}"#,
        )]);
        let mut ctx = context(
            CallDirection::Inbound,
            Phase::Identification,
            "Soy Ana Pérez, cédula 52123456, de Cosalud",
        );
        ctx.state.validation_attempt_count = 2;

        let ctx = pipeline(llm).run(ctx).await.unwrap();

        assert_eq!(ctx.state.current_phase, Phase::LegalNotice);
        assert_eq!(ctx.state.validation_attempt_count, 0);
        assert_eq!(ctx.state.patient.full_name.as_deref(), Some("Ana Pérez"));
        assert_eq!(ctx.extracted.len(), 3);
        assert!(ctx.state.service.pickup_address.is_none());
    }

    #[tokio::test]
    async fn incident_summary_is_classified() {
        let llm = ScriptedLlm::new(&[&reply(
            "Lamento lo ocurrido, registro su queja.",
            "INCIDENT_MANAGEMENT",
            r#"{"incident_summary": "El conductor llegó tarde dos veces"}"#,
        )]);
        let ctx = pipeline(llm)
            .run(context(
                CallDirection::Inbound,
                Phase::ServiceCoordination,
                "Quiero poner una queja, el conductor llegó tarde",
            ))
            .await
            .unwrap();

        assert_eq!(ctx.state.current_phase, Phase::IncidentManagement);
        assert_eq!(ctx.state.incidents.len(), 1);
        assert_eq!(ctx.state.incidents[0].kind, IncidentType::Lateness);
    }

    #[tokio::test]
    async fn outbound_legal_notice_stall_is_broken() {
        let llm = ScriptedLlm::new(&[&reply(
            "Gracias. Le recuerdo que la llamada es grabada.",
            "OUTBOUND_LEGAL_NOTICE",
            "{}",
        )]);
        let ctx = pipeline(llm)
            .run(context(CallDirection::Outbound, Phase::OutboundLegalNotice, "Sí, claro"))
            .await
            .unwrap();
        assert_eq!(ctx.state.current_phase, Phase::OutboundServiceConfirmation);
        assert!(ctx.state.legal_notice_acknowledged);
    }

    #[tokio::test]
    async fn wrong_number_routes_to_special_case() {
        let llm = ScriptedLlm::new(&[&reply(
            "Entiendo, disculpe.",
            "OUTBOUND_SPECIAL_CASES",
            r#"{"wrong_number": true}"#,
        )]);
        let ctx = pipeline(llm)
            .run(context(
                CallDirection::Outbound,
                Phase::OutboundServiceConfirmation,
                "No, aquí no vive nadie con ese nombre",
            ))
            .await
            .unwrap();

        assert_eq!(ctx.special_case, Some(SpecialCase::WrongNumber));
        assert_eq!(ctx.agent_response, WRONG_NUMBER_REPLY);
        assert!(ctx.state.requires_human_review);
        assert_eq!(ctx.state.current_phase, Phase::End);
        // No directory configured: the sink stage runs but writes nothing.
        assert_eq!(ctx.metadata.stages.last().map(String::as_str), Some("data_sink_writer"));
        assert!(!ctx.metadata.data_sink_written);
    }

    #[tokio::test]
    async fn wrong_number_on_greeting_ends_call_and_records_outcome() {
        let directory = Arc::new(InMemoryPatientDirectory::new(vec![PatientRecord {
            first_name: "Carmen".into(),
            last_name: "Gamero".into(),
            phone: "3001234567".into(),
            ..Default::default()
        }]));
        let llm = ScriptedLlm::new(&[&reply(
            "Entiendo, disculpe.",
            "OUTBOUND_GREETING",
            r#"{"wrong_number": true}"#,
        )]);
        let pipeline = TurnPipeline::new(
            Arc::new(AgentConfig::default()),
            ReplyClient::new(llm, 0.3, 500),
            Some(directory.clone()),
        );
        let mut ctx = context(
            CallDirection::Outbound,
            Phase::OutboundGreeting,
            "No, aquí no vive ninguna Carmen",
        );
        ctx.state.patient_row = Some(0);

        let ctx = pipeline.run(ctx).await.unwrap();

        assert_eq!(ctx.agent_response, WRONG_NUMBER_REPLY);
        assert_eq!(ctx.state.current_phase, Phase::End);
        assert_eq!(ctx.transitions.first().map(|t| t.0), Some(Phase::OutboundGreeting));
        assert_eq!(ctx.transitions.last(), Some(&(Phase::OutboundClosing, Phase::End)));
        assert!(ctx.metadata.data_sink_written);

        let record = directory.record(0).await.unwrap();
        assert_eq!(record.status, CallStatus::Rejected);
        assert_eq!(record.observations.len(), 1);
        assert!(record.observations[0].ends_with("Llamada completada - Número equivocado"));
    }

    #[tokio::test]
    async fn deceased_patient_ends_inbound_call() {
        let llm = ScriptedLlm::new(&[&reply(
            "Lo siento mucho.",
            "IDENTIFICATION",
            r#"{"patient_deceased": true}"#,
        )]);
        let ctx = pipeline(llm)
            .run(context(
                CallDirection::Inbound,
                Phase::Identification,
                "Mi mamá falleció la semana pasada",
            ))
            .await
            .unwrap();

        assert_eq!(ctx.agent_response, PATIENT_DECEASED_REPLY);
        assert_eq!(ctx.state.current_phase, Phase::End);
        assert!(ctx.state.requires_human_review);
        assert!(!ctx.metadata.data_sink_written);
    }

    #[tokio::test]
    async fn escalation_in_greeting_does_not_repeat() {
        let llm = ScriptedLlm::new(&[&reply(
            "Con gusto. ¿Me regala su nombre completo?",
            "IDENTIFICATION",
            "{}",
        )]);
        let pipeline = pipeline(llm.clone());

        let first = pipeline
            .run(context(CallDirection::Inbound, Phase::Greeting, "Hola, mi EPS es Sanitas"))
            .await
            .unwrap();
        assert!(first.escalation.escalate);
        assert!(first.state.requires_human_review);
        assert_eq!(first.state.current_phase, Phase::Greeting);
        assert_eq!(first.metadata.llm_calls, 0);

        // The stored insurer still fails eligibility, but the call was
        // already handed off.
        let second = pipeline.run(next_turn(first, "¿Aló? ¿Sigue ahí?")).await.unwrap();
        assert!(!second.escalation.escalate);
        assert_eq!(second.metadata.llm_calls, 1);
        assert_eq!(second.state.current_phase, Phase::Identification);
        assert_eq!(llm.requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn outbound_greeting_escalation_lets_the_call_continue() {
        let llm = ScriptedLlm::new(&[&reply(
            "Gracias. Le informo que esta llamada es grabada.",
            "OUTBOUND_LEGAL_NOTICE",
            "{}",
        )]);
        let pipeline = pipeline(llm);
        let mut ctx = context(CallDirection::Outbound, Phase::OutboundGreeting, "Aló, sí, soy yo");
        ctx.state.service.pickup_address = Some("Vereda El Carmen, finca 3".into());

        let first = pipeline.run(ctx).await.unwrap();
        assert!(first.escalation.escalate);
        assert!(first.agent_response.contains("Zona rural fuera de cobertura"));
        assert_eq!(first.metadata.special_case, Some(SpecialCase::Escalation));
        assert_eq!(first.state.current_phase, Phase::OutboundGreeting);

        let second = pipeline.run(next_turn(first, "Bueno, ¿y entonces?")).await.unwrap();
        assert!(!second.escalation.escalate);
        assert_eq!(second.metadata.llm_calls, 1);
        assert_eq!(second.state.current_phase, Phase::OutboundLegalNotice);
    }

    #[tokio::test]
    async fn minor_revealed_this_turn_gets_no_details() {
        let llm = ScriptedLlm::new(&[&reply(
            "Perfecto, el carro pasa a las 7:30 por la calle 10.",
            "OUTBOUND_SERVICE_CONFIRMATION",
            r#"{"contact_relationship": "nieto", "contact_age": 12}"#,
        )]);
        let ctx = pipeline(llm)
            .run(context(
                CallDirection::Outbound,
                Phase::OutboundServiceConfirmation,
                "Soy el nieto, tengo 12 años",
            ))
            .await
            .unwrap();

        assert_eq!(ctx.agent_response, MINOR_CONTACT_FALLBACK);
        assert!(ctx.metadata.validation_fallback);
        assert_eq!(ctx.state.patient.contact_age, Some(12));
    }

    #[tokio::test]
    async fn closing_call_writes_outcome() {
        let directory = Arc::new(InMemoryPatientDirectory::new(vec![PatientRecord {
            first_name: "Carmen".into(),
            last_name: "Gamero".into(),
            phone: "3001234567".into(),
            ..Default::default()
        }]));
        let llm = ScriptedLlm::new(&[&reply(
            "Muchas gracias, que tenga un buen día.",
            "END",
            r#"{"service_confirmed": true}"#,
        )]);
        let pipeline = TurnPipeline::new(
            Arc::new(AgentConfig::default()),
            ReplyClient::new(llm, 0.3, 500),
            Some(directory.clone()),
        );
        let mut ctx = context(CallDirection::Outbound, Phase::OutboundClosing, "Gracias a usted");
        ctx.state.patient_row = Some(0);

        let ctx = pipeline.run(ctx).await.unwrap();

        assert_eq!(ctx.state.current_phase, Phase::End);
        assert!(ctx.metadata.data_sink_written);
        let record = directory.record(0).await.unwrap();
        assert_eq!(record.status, CallStatus::Confirmed);
        assert!(record.observations[0].ends_with("Llamada completada - Servicio confirmado"));
    }

    #[test]
    fn call_status_precedence() {
        let mut state =
            SessionState::new("s-1", CallDirection::Outbound, "María", "Transformas", "Cosalud");
        assert_eq!(call_status(&state), CallStatus::Pending);

        state.outbound.service_confirmed = true;
        assert_eq!(call_status(&state), CallStatus::Confirmed);

        state.outbound.new_appointment_date = Some("2025-11-03".into());
        assert_eq!(call_status(&state), CallStatus::Reschedule);

        state.outbound.coverage_issue = true;
        assert_eq!(call_status(&state), CallStatus::NoCoverage);
        assert_eq!(
            call_observations(&state),
            "Llamada completada - Servicio confirmado - Fecha reprogramada: 2025-11-03 - Zona sin cobertura"
        );
    }
}
