//! Turn pipeline.
//!
//! Every caller message flows through the same graph of stages:
//! 1. `rules`: regex analysis of the message (no model)
//! 2. `PolicyEngine` and escalation checks: may answer without the model
//! 3. `processor`: at most one model call, validated and merged into state
//!
//! The model proposes; the pipeline decides. Phase changes, escalation and
//! data-sink writes are all gated here.

pub mod graph;
pub mod processor;
pub mod prompts;
pub mod rules;
pub mod types;
pub mod validator;

pub use graph::Node;
pub use processor::{LLM_FALLBACK_REPLY, TurnPipeline};
pub use types::{PhaseAnomaly, SpecialCase, TurnContext, TurnMetadata};
