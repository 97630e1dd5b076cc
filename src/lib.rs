//! Medtrip Agent: conversation engine for medical-transport phone calls.

pub mod config;
pub mod error;
pub mod escalation;
pub mod llm;
pub mod orchestrator;
pub mod patients;
pub mod phase;
pub mod pipeline;
pub mod policy;
pub mod session;
pub mod store;
