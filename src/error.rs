//! Error types for the medical-transport call agent.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported session schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Turn pipeline errors.
///
/// Escalations and model failures are control flow, not errors. These only
/// surface when the per-turn context itself is inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid turn context at {stage}: {reason}")]
    InvalidContext { stage: String, reason: String },

    #[error("Pipeline did not terminate after {steps} steps")]
    Runaway { steps: usize },
}

/// Patient data provider errors.
#[derive(Debug, thiserror::Error)]
pub enum PatientDataError {
    #[error("Patient record {row} not found")]
    RowNotFound { row: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestrator to its caller.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("No patient registered for phone {0}")]
    PatientNotFound(String),

    #[error("Outbound calls require a patient data provider")]
    PatientDirectoryUnavailable,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Call {0} has already ended")]
    CallEnded(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    PatientData(#[from] PatientDataError),
}
