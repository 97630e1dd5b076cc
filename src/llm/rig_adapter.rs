//! Bridges a rig-core `CompletionModel` to [`LlmProvider`].

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{Chat, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
///
/// System messages become the agent preamble, the final user message is the
/// prompt, and everything in between is replayed as chat history.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Clone + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let split = split_request(&request.messages).map_err(|reason| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason,
        })?;

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&split.preamble);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let agent = builder.build();

        let history: Vec<Message> = split
            .history
            .iter()
            .map(|m| match m.role {
                Role::Assistant => Message::assistant(m.content.clone()),
                _ => Message::user(m.content.clone()),
            })
            .collect();

        let content = agent
            .chat(Message::user(split.prompt.clone()), history)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        Ok(CompletionResponse {
            content,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[derive(Debug)]
struct SplitRequest<'a> {
    preamble: String,
    history: Vec<&'a ChatMessage>,
    prompt: String,
}

fn split_request(messages: &[ChatMessage]) -> Result<SplitRequest<'_>, String> {
    let preamble = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut dialogue: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role != Role::System).collect();

    let last = dialogue
        .pop()
        .ok_or_else(|| "request has no user message".to_string())?;
    if last.role != Role::User {
        return Err("last message must come from the user".to_string());
    }

    Ok(SplitRequest {
        preamble,
        history: dialogue,
        prompt: last.content.clone(),
    })
}
