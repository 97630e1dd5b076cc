//! Structured turn replies: the contract between the pipeline and the model.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::phase::Phase;

/// Fields every reply must carry, even when null.
const REQUIRED_FIELDS: [&str; 5] = [
    "agent_response",
    "next_phase",
    "requires_escalation",
    "escalation_reason",
    "extracted",
];

/// The model's answer for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnReply {
    /// What the agent says next. Never empty.
    pub agent_response: String,
    /// Phase the model wants to move to; still subject to [`Phase::resolve`].
    pub next_phase: Phase,
    pub requires_escalation: bool,
    pub escalation_reason: Option<String>,
    /// Data the model pulled out of the caller's words.
    pub extracted: Map<String, Value>,
}

impl TurnReply {
    /// Parse raw model output, rejecting anything not fully conforming.
    pub fn parse(raw: &str, provider: &str) -> Result<Self, LlmError> {
        let invalid = |reason: String| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        };

        let json_str = extract_json_object(raw);
        let value: Value = serde_json::from_str(&json_str)
            .map_err(|e| invalid(format!("JSON parse error: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| invalid("reply is not a JSON object".to_string()))?;

        if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !object.contains_key(**f)) {
            return Err(invalid(format!("missing field `{missing}`")));
        }

        let reply: TurnReply =
            serde_json::from_value(value).map_err(|e| invalid(format!("schema mismatch: {e}")))?;
        if reply.agent_response.trim().is_empty() {
            return Err(invalid("agent_response is empty".to_string()));
        }
        Ok(reply)
    }
}

/// Extract a JSON object from model output that may be wrapped in prose or
/// a markdown fence.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Sends a turn's messages to a provider and returns a validated reply.
#[derive(Clone)]
pub struct ReplyClient {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
}

impl ReplyClient {
    pub fn new(provider: Arc<dyn LlmProvider>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            provider,
            temperature,
            max_tokens,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// One completion, parsed into a [`TurnReply`]. Never retries.
    pub async fn respond(&self, messages: Vec<ChatMessage>) -> Result<TurnReply, LlmError> {
        let request = CompletionRequest::new(messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let response = self.provider.complete(request).await?;
        debug!(
            model = %self.provider.model_name(),
            chars = response.content.len(),
            "Model reply received"
        );
        TurnReply::parse(&response.content, self.provider.model_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "agent_response": "Buenos días, ¿con quién tengo el gusto?",
        "next_phase": "IDENTIFICATION",
        "requires_escalation": false,
        "escalation_reason": null,
        "extracted": {"patient_full_name": null}
    }"#;

    #[test]
    fn parses_complete_reply() {
        let reply = TurnReply::parse(VALID, "test").unwrap();
        assert_eq!(reply.next_phase, Phase::Identification);
        assert!(!reply.requires_escalation);
        assert!(reply.escalation_reason.is_none());
        assert!(reply.extracted.contains_key("patient_full_name"));
    }

    #[test]
    fn parses_reply_inside_markdown_fence() {
        let wrapped = format!("Aquí está:\n```json\n{VALID}\n```");
        let reply = TurnReply::parse(&wrapped, "test").unwrap();
        assert_eq!(reply.next_phase, Phase::Identification);
    }

    #[test]
    fn rejects_missing_nullable_field() {
        let raw = r#"{"agent_response": "Hola", "next_phase": "GREETING",
            "requires_escalation": false, "extracted": {}}"#;
        match TurnReply::parse(raw, "test") {
            Err(LlmError::InvalidResponse { reason, .. }) => {
                assert!(reason.contains("escalation_reason"), "got {reason}")
            }
            other => panic!("Expected InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_phase_and_wrong_types() {
        let unknown_phase = VALID.replace("IDENTIFICATION", "LOBBY");
        assert!(TurnReply::parse(&unknown_phase, "test").is_err());

        let wrong_type = VALID.replace("\"requires_escalation\": false", "\"requires_escalation\": \"no\"");
        assert!(TurnReply::parse(&wrong_type, "test").is_err());

        let null_extracted = VALID.replace("{\"patient_full_name\": null}", "null");
        assert!(TurnReply::parse(&null_extracted, "test").is_err());
    }

    #[test]
    fn rejects_empty_agent_response() {
        let raw = VALID.replace("Buenos días, ¿con quién tengo el gusto?", "  ");
        assert!(TurnReply::parse(&raw, "test").is_err());
    }

    #[test]
    fn rejects_plain_text() {
        assert!(TurnReply::parse("Lo siento, no puedo ayudar.", "test").is_err());
    }

    #[test]
    fn extract_json_from_prose() {
        let got = extract_json_object("Respuesta: {\"a\": 1} fin");
        assert_eq!(got, "{\"a\": 1}");
    }
}
