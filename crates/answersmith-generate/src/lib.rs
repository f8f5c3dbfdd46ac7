//! Provider-fallback generation for answersmith.
//!
//! This crate provides:
//! - **[`ProviderBreaker`]**: a per-provider circuit breaker
//!   (Closed → Open → HalfOpen) with atomic state shared across concurrent
//!   requests, single-probe admission, and cooldown doubling.
//! - **[`GenerationOrchestrator`]**: ordered provider fallback honoring
//!   request hints, with per-attempt timeouts and both single-shot and
//!   streaming completion paths.

pub mod breaker;
pub mod orchestrator;

pub use breaker::{BreakerConfig, BreakerDecision, BreakerMetrics, ProviderBreaker};
pub use orchestrator::{GenerationConfig, GenerationOrchestrator, build_prompt};
