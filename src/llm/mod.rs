//! LLM integration.
//!
//! Supports:
//! - **OpenAI**: Direct API access via rig-core
//! - **Anthropic**: Direct API access via rig-core
//!
//! The pipeline only sees [`ReplyClient`], which turns raw completions into
//! validated [`TurnReply`] values.

pub mod provider;
mod rig_adapter;
pub mod structured;

pub use provider::*;
pub use rig_adapter::RigAdapter;
pub use structured::{ReplyClient, TurnReply, extract_json_object};

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    /// Read `MEDTRIP_LLM_BACKEND`, the backend's API key and model settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("MEDTRIP_LLM_BACKEND")
            .unwrap_or_else(|_| "openai".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmBackend::OpenAi,
            "anthropic" => LlmBackend::Anthropic,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "MEDTRIP_LLM_BACKEND".to_string(),
                    message: format!("unknown backend '{other}', expected openai or anthropic"),
                });
            }
        };

        let (key_var, default_model) = match backend {
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o-mini"),
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = std::env::var("MEDTRIP_MODEL").unwrap_or_else(|_| default_model.to_string());
        let temperature: f32 = std::env::var("MEDTRIP_TEMPERATURE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.3);
        let max_tokens: u32 = std::env::var("MEDTRIP_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        Ok(Self {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model,
            temperature,
            max_tokens,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: secrecy::SecretString::from("test-key"),
            model: model.to_string(),
            temperature: 0.3,
            max_tokens: 1000,
        }
    }

    #[test]
    fn test_create_openai_provider() {
        // Clients accept any key at construction; auth fails on first request.
        let provider = create_provider(&config(LlmBackend::OpenAi, "gpt-4o-mini"));
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_create_anthropic_provider() {
        let provider = create_provider(&config(LlmBackend::Anthropic, "claude-sonnet-4-20250514"));
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "claude-sonnet-4-20250514");
    }
}
