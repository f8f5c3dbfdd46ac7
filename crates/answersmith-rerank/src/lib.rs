//! Reorder-and-select reranking for answersmith.
//!
//! Provides the [`RerankerChain`]: an ordered sequence of
//! [`RerankStage`](answersmith_core::RerankStage) implementations (model-based,
//! cross-encoder-style, or none) composed sequentially with per-stage timeouts.
//! Stage failures degrade gracefully to the previous ordering; the chain can
//! never fail the pipeline outright.

pub mod chain;

pub use chain::{DEFAULT_STAGE_TIMEOUT_MS, RerankerChain};
