//! Collaborator traits for the answersmith pipeline.
//!
//! - [`DenseRetriever`] / [`LexicalRetriever`]: uniform read access to the two
//!   retrieval signals.
//! - [`Embedder`]: query embedding, used for dense retrieval and the cache's
//!   similarity lookup.
//! - [`RerankStage`]: one reorder-and-select stage in the reranking chain.
//! - [`LlmProvider`]: a language-model backend behind one capability
//!   interface, selected via an explicit priority list.
//! - [`QualityEvaluator`]: judges a candidate answer against its evidence.
//!
//! Implementations of these collaborators live outside this workspace; the
//! pipeline only depends on the contracts. Async operations are represented
//! as boxed futures so the traits remain dyn-compatible
//! (`Arc<dyn LlmProvider>`, etc.), and each receives a capability context
//! (`&Cx`) as its first parameter for cancellation.

use std::future::Future;
use std::pin::Pin;

use asupersync::Cx;
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::types::{Candidate, GenerationParams, ProviderKind, QualityEvaluation};

/// Boxed future carrying a `PipelineResult<T>`.
pub type PipelineFuture<'a, T> = Pin<Box<dyn Future<Output = PipelineResult<T>> + Send + 'a>>;

// ─── Retrieval ──────────────────────────────────────────────────────────────

/// Dense (embedding-similarity) retrieval backend.
pub trait DenseRetriever: Send + Sync {
    /// Search for the `top_k` candidates closest to `query_embedding`,
    /// ordered descending by similarity.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the backend is unreachable or the query
    /// cannot be executed.
    fn search<'a>(
        &'a self,
        cx: &'a Cx,
        query_embedding: &'a [f32],
        top_k: usize,
    ) -> PipelineFuture<'a, Vec<Candidate>>;

    /// Stable identifier for this retriever (used in logs and traces).
    fn id(&self) -> &str;
}

/// Lexical (BM25-family) retrieval backend.
pub trait LexicalRetriever: Send + Sync {
    /// Search for the `top_k` candidates matching `query`, ordered descending
    /// by lexical relevance.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the backend is unreachable or the query
    /// cannot be parsed.
    fn search<'a>(
        &'a self,
        cx: &'a Cx,
        query: &'a str,
        top_k: usize,
    ) -> PipelineFuture<'a, Vec<Candidate>>;

    /// Stable identifier for this retriever.
    fn id(&self) -> &str;
}

/// Text embedding model used for dense retrieval and similarity caching.
pub trait Embedder: Send + Sync {
    /// Embed a single text into a vector of exactly `self.dimension()` floats.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::EmbeddingFailed` if inference fails.
    fn embed<'a>(&'a self, cx: &'a Cx, text: &'a str) -> PipelineFuture<'a, Vec<f32>>;

    /// The dimensionality of vectors produced by this model.
    fn dimension(&self) -> usize;

    /// Stable identifier for this embedder.
    fn id(&self) -> &str;
}

// ─── Reranking ──────────────────────────────────────────────────────────────

/// A relevance score assigned to one candidate by a rerank stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankScore {
    /// Candidate identifier.
    pub id: String,
    /// Stage-assigned relevance score (higher is better).
    pub score: f32,
    /// Position in the stage's input (for score-to-candidate mapping even
    /// after the stage sorts its output).
    pub original_rank: usize,
}

/// One stage in the reranking chain.
///
/// # Graceful Failure
///
/// A stage failure must never block answers. The chain catches stage errors
/// and passes the stage's unmodified input to the next stage; implementations
/// should return an error rather than panic.
pub trait RerankStage: Send + Sync {
    /// Score candidates against the query. Returns one score per input
    /// candidate, in any order (the chain maps them back via `original_rank`).
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RerankFailed` if scoring fails.
    fn rerank<'a>(
        &'a self,
        cx: &'a Cx,
        query: &'a str,
        candidates: &'a [Candidate],
    ) -> PipelineFuture<'a, Vec<RerankScore>>;

    /// Stable identifier for this stage.
    fn id(&self) -> &str;

    /// Maximum number of candidates this stage can score; the chain truncates
    /// its working set to this bound before invoking, never erroring on
    /// oversize input.
    fn max_documents(&self) -> usize {
        100
    }

    /// Whether the chain should stop after this stage succeeds.
    fn is_terminal(&self) -> bool {
        false
    }
}

// ─── Generation ─────────────────────────────────────────────────────────────

/// Raw output of one provider completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// The completed text.
    pub text: String,
    /// Tokens consumed by the call.
    pub tokens_used: u64,
}

/// A language-model provider behind the single capability interface.
///
/// Providers are a closed set ([`ProviderKind`]) selected via an explicit
/// priority list, never discovered dynamically.
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt in one shot.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ProviderFailed` on any backend failure.
    fn complete<'a>(
        &'a self,
        cx: &'a Cx,
        prompt: &'a str,
        params: &'a GenerationParams,
    ) -> PipelineFuture<'a, Completion>;

    /// Complete a prompt, forwarding incremental text to `on_token` as it
    /// arrives. The returned [`Completion`] carries the full concatenated
    /// text for post-stream quality gating.
    ///
    /// The default implementation performs a single-shot completion and
    /// forwards the whole answer as one token.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ProviderFailed` on any backend failure.
    fn complete_streaming<'a>(
        &'a self,
        cx: &'a Cx,
        prompt: &'a str,
        params: &'a GenerationParams,
        on_token: &'a (dyn Fn(&str) + Send + Sync),
    ) -> PipelineFuture<'a, Completion> {
        Box::pin(async move {
            let completion = self.complete(cx, prompt, params).await?;
            on_token(&completion.text);
            Ok(completion)
        })
    }

    /// Which provider family this is.
    fn kind(&self) -> ProviderKind;

    /// Stable identifier for this provider instance.
    fn id(&self) -> &str;
}

// ─── Quality evaluation ─────────────────────────────────────────────────────

/// Judges a candidate answer for groundedness and relevance.
pub trait QualityEvaluator: Send + Sync {
    /// Evaluate `answer` against `query` and its supporting `evidence`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::EvaluationFailed` if the evaluator itself
    /// fails; the gate absorbs this and degrades gracefully.
    fn evaluate<'a>(
        &'a self,
        cx: &'a Cx,
        query: &'a str,
        answer: &'a str,
        evidence: &'a [Candidate],
    ) -> PipelineFuture<'a, QualityEvaluation>;

    /// Stable identifier for this evaluator.
    fn id(&self) -> &str;
}

// ─── Vector utilities ───────────────────────────────────────────────────────

/// Computes cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero-norm inputs — a silent
/// truncating zip would otherwise hide dimensionality bugs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    let denom = norm_a * norm_b;
    if !denom.is_finite() || denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
