//! # answersmith
//!
//! Hybrid-retrieval answer orchestration: natural-language queries answered
//! by fusing dense and lexical retrieval signals, reordering candidates
//! through a reranking chain, generating a grounded answer with ordered
//! provider fallback, and retrying under a quality gate until the answer is
//! good enough or the budget is spent.
//!
//! # Quick Start
//!
//! Wire your retrievers, providers, and evaluator into a coordinator
//! (collaborator traits live in [`answersmith_core`]):
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use answersmith::prelude::*;
//!
//! asupersync::test_utils::run_test_with_cx(|cx| async move {
//!     let retriever = HybridRetriever::new(dense, lexical, embedder, RetrievalConfig::default());
//!     let chain = RerankerChain::new().with_stage(cross_encoder);
//!     let orchestrator = GenerationOrchestrator::new(providers, GenerationConfig::default());
//!     let coordinator = PipelineCoordinator::new(
//!         retriever,
//!         chain,
//!         orchestrator,
//!         evaluator,
//!         PipelineConfig::default().with_env_overrides(),
//!     )
//!     .expect("valid config");
//!
//!     let answer = coordinator
//!         .answer(&cx, &AnswerRequest::new("how does rank fusion work?"))
//!         .await
//!         .expect("answer");
//!     println!("[{}] {}", answer.provider_used, answer.text);
//! });
//! ```
//!
//! # Architecture
//!
//! ```text
//!  Query ─┬─► Dense retrieval ───┐
//!         │                       ├─► RRF Fusion ─► Rerank Chain ─► Generation ─► Quality Gate
//!         └─► Lexical retrieval ─┘        ▲          (compose,       (provider      (accept /
//!                   ▲                     │           timeout,        fallback,      retry /
//!              Result Cache ◄─────────────┴───────────degrade)       breakers)      exhaust)
//! ```
//!
//! ## Crate Layout
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `answersmith-core` | Types, collaborator traits, errors, events, trace |
//! | `answersmith-fusion` | RRF fusion, parallel retrieval fan-out, result cache |
//! | `answersmith-rerank` | Reranking stage chain with graceful degradation |
//! | `answersmith-generate` | Provider fallback + per-provider circuit breakers |
//! | `answersmith-pipeline` | Quality gate, coordinator, aggregated config |
//!
//! ## Key Types
//!
//! - [`PipelineCoordinator`] — one request-scoped execution, owns the retry loop
//! - [`AnswerRequest`] / [`PipelineAnswer`] — the consumer contract
//! - [`AnswerStream`] — bounded, ordered event stream for streaming consumers
//! - [`QualityGate`] — accept / retry / exhaust state machine
//! - [`ProviderBreaker`] — circuit breaker shared across concurrent requests
//! - [`PipelineConfig`] — all tuning knobs, env- and TOML-overridable

pub use answersmith_core::{
    AnswerEvent, AnswerFrame, AnswerStream, AnswerStreamConfig, AnswerStreamHealth,
    AnswerStreamMode, Candidate, Completion, Cx, DenseRetriever, Embedder, FusedHit, FusedResult,
    FusionParams, GenerationParams, GenerationRequest, GenerationResult, LexicalRetriever,
    LlmProvider, PipelineAnswer, PipelineError, PipelineFuture, PipelineResult, PipelineTrace,
    ProviderKind, QualityAdjustment, QualityEvaluation, QualityEvaluator, QualityFlag,
    QualityReason, RERANK_STAGE_NONE, RerankScore, RerankStage, RerankedHit, RerankedResult,
    RetrievalSource, StageTrace, cosine_similarity,
};
pub use answersmith_fusion::{
    CacheConfig, CacheHit, CacheMetrics, FusionConfig, HybridRetriever, QueryCache,
    RetrievalConfig, cache_key, candidate_count, fuse,
};
pub use answersmith_generate::{
    BreakerConfig, BreakerDecision, BreakerMetrics, GenerationConfig, GenerationOrchestrator,
    ProviderBreaker, build_prompt,
};
pub use answersmith_pipeline::{
    AnswerRequest, AttemptRecord, GateDirective, GateState, PipelineConfig, PipelineCoordinator,
    QualityGate, QualityGateConfig,
};
pub use answersmith_rerank::RerankerChain;

/// Commonly used types for wiring a pipeline.
pub mod prelude {
    pub use answersmith_core::{
        AnswerStream, Candidate, Cx, PipelineAnswer, PipelineError, PipelineResult, ProviderKind,
        QualityFlag,
    };
    pub use answersmith_fusion::{HybridRetriever, RetrievalConfig};
    pub use answersmith_generate::{GenerationConfig, GenerationOrchestrator};
    pub use answersmith_pipeline::{AnswerRequest, PipelineConfig, PipelineCoordinator};
    pub use answersmith_rerank::RerankerChain;
}
