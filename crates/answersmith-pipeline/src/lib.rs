//! Quality-gated answer pipeline coordination for answersmith.
//!
//! This crate provides:
//! - **[`QualityGate`]**: the accept / retry / exhaust state machine bounding
//!   the retry loop to `budget + 1` attempts.
//! - **[`PipelineCoordinator`]**: request-scoped wiring of cache → retrieval
//!   → fusion → rerank → generation → evaluation, including the streaming
//!   event path and the overall request deadline.
//! - **[`PipelineConfig`]**: aggregated configuration with env-variable and
//!   TOML overrides.

pub mod config;
pub mod coordinator;
pub mod gate;

pub use config::PipelineConfig;
pub use coordinator::{AnswerRequest, PipelineCoordinator};
pub use gate::{AttemptRecord, GateDirective, GateState, QualityGate, QualityGateConfig};
