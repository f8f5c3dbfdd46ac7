//! Core traits, types, and errors for the answersmith answer pipeline.
//!
//! This crate defines the collaborator interfaces ([`DenseRetriever`],
//! [`LexicalRetriever`], [`Embedder`], [`RerankStage`], [`LlmProvider`],
//! [`QualityEvaluator`]), result types ([`Candidate`], [`FusedResult`],
//! [`RerankedResult`], [`GenerationResult`], [`PipelineAnswer`]), the unified
//! error type ([`PipelineError`]), the bounded streaming event surface
//! ([`AnswerStream`]), and the optional execution trace used across all
//! answersmith crates.
//!
//! It has minimal external dependencies and is intended to be depended on by
//! every other crate in the workspace.

pub mod error;
pub mod events;
pub mod trace;
pub mod tracing_config;
pub mod traits;
pub mod types;

pub use asupersync::Cx;
pub use error::{PipelineError, PipelineResult};
pub use events::{
    AnswerEvent, AnswerFrame, AnswerStream, AnswerStreamConfig, AnswerStreamHealth,
    AnswerStreamMode, DEFAULT_ANSWER_STREAM_CAPACITY,
};
pub use trace::{PipelineTrace, StageTrace};
pub use traits::{
    Completion, DenseRetriever, Embedder, LexicalRetriever, LlmProvider, PipelineFuture,
    QualityEvaluator, RerankScore, RerankStage, cosine_similarity,
};
pub use types::{
    Candidate, FusedHit, FusedResult, FusionParams, GenerationParams, GenerationRequest,
    GenerationResult, PipelineAnswer, ProviderKind, QualityAdjustment, QualityEvaluation,
    QualityFlag, QualityReason, RERANK_STAGE_NONE, RerankedHit, RerankedResult, RetrievalSource,
};
