//! Unified error type for the answersmith answer pipeline.
//!
//! Every variant carries an actionable message guiding the consumer toward
//! resolution. The coordinator absorbs recoverable conditions at component
//! boundaries (a failed rerank stage, a cache miss, a single provider failure
//! with fallbacks remaining) and only surfaces variants with no remaining
//! fallback. User-visible failures are structured: [`PipelineError::reason_code`]
//! yields a stable machine-readable code and
//! [`PipelineError::remediation_hints`] a short hint list, so transports never
//! have to leak a raw internal error.

/// Unified error type covering all failure modes across the answer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // === Retrieval errors ===
    /// Both retrieval sources failed; there is no evidence to reason about.
    /// This is fatal and is never retried by the quality loop.
    #[error(
        "Both retrievers failed (dense: {dense}; lexical: {lexical}). Check retriever backends before retrying."
    )]
    RetrievalUnavailable {
        /// Why the dense side failed.
        dense: String,
        /// Why the lexical side failed.
        lexical: String,
    },

    /// One retrieval backend failed. Absorbed by the fan-out while the other
    /// signal remains.
    #[error("Retriever {retriever} failed: {source}. Continuing with the remaining signal.")]
    RetrieverFailed {
        /// Which retriever failed.
        retriever: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Query embedding failed, so dense retrieval and similarity caching are
    /// unavailable for this request.
    #[error("Embedding failed for {model}: {source}. Dense retrieval degrades to lexical-only.")]
    EmbeddingFailed {
        /// Which embedding model failed.
        model: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Rerank errors ===
    /// A rerank stage failed. Absorbed by the chain; results stay valid with
    /// the previous ordering.
    #[error("Rerank stage {stage} failed: {source}. Results still valid with the prior ordering.")]
    RerankFailed {
        /// Which stage failed.
        stage: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Generation errors ===
    /// One provider attempt failed. Absorbed while fallback providers remain.
    #[error("Provider {provider} failed: {source}")]
    ProviderFailed {
        /// Which provider failed.
        provider: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// One provider attempt exceeded its per-attempt budget.
    #[error(
        "Provider {provider} timed out after {elapsed_ms}ms (budget: {budget_ms}ms). Trying the next provider."
    )]
    ProviderTimeout {
        /// Which provider timed out.
        provider: String,
        /// How long the attempt ran.
        elapsed_ms: u64,
        /// The configured attempt budget.
        budget_ms: u64,
    },

    /// Every provider in priority order failed or was circuit-open.
    #[error(
        "All generation providers exhausted ({}). Check provider credentials and circuit-breaker state.",
        attempted.join(", ")
    )]
    AllProvidersExhausted {
        /// Per-provider outcome summaries, in attempt order.
        attempted: Vec<String>,
    },

    // === Evaluation errors ===
    /// The quality evaluator itself failed. Absorbed by the gate; the current
    /// answer is returned with a degraded quality flag.
    #[error("Quality evaluation via {evaluator} failed: {source}. Answer returned unevaluated.")]
    EvaluationFailed {
        /// Which evaluator failed.
        evaluator: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Cache errors ===
    /// The result cache is unusable. Non-fatal: the pipeline proceeds uncached.
    #[error("Result cache unavailable: {reason}. Pipeline continues uncached.")]
    CacheUnavailable {
        /// Why the cache is unusable.
        reason: String,
    },

    // === Streaming errors ===
    /// The bounded answer stream is full (non-lossy mode).
    #[error(
        "Answer stream full ({pending}/{capacity} pending). Apply backpressure or increase capacity."
    )]
    QueueFull {
        /// Number of buffered events.
        pending: usize,
        /// Stream capacity.
        capacity: usize,
    },

    /// A publish was attempted after the terminal event closed the stream.
    #[error("Answer stream already closed by a terminal event; {rejected} rejected.")]
    StreamClosed {
        /// Description of the rejected event.
        rejected: String,
    },

    // === Budget errors ===
    /// The overall request deadline fired before any answer was produced.
    #[error(
        "Pipeline deadline exceeded after {elapsed_ms}ms (budget: {budget_ms}ms). Increase the deadline or narrow the query."
    )]
    DeadlineExceeded {
        /// How long the request ran.
        elapsed_ms: u64,
        /// The configured overall budget.
        budget_ms: u64,
    },

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\" — {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    // === Cancellation ===
    /// Operation was cancelled via the structured concurrency context.
    #[error("Operation cancelled during {phase}: {reason}")]
    Cancelled {
        /// Which phase was active when cancelled.
        phase: String,
        /// Cancellation reason.
        reason: String,
    },
}

impl PipelineError {
    /// Stable machine-readable reason code for transports and dashboards.
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::RetrievalUnavailable { .. } => "retrieval.unavailable",
            Self::RetrieverFailed { .. } => "retrieval.source_failed",
            Self::EmbeddingFailed { .. } => "retrieval.embedding_failed",
            Self::RerankFailed { .. } => "rerank.stage_failed",
            Self::ProviderFailed { .. } => "generate.provider_failed",
            Self::ProviderTimeout { .. } => "generate.provider_timeout",
            Self::AllProvidersExhausted { .. } => "generate.exhausted",
            Self::EvaluationFailed { .. } => "quality.evaluator_failed",
            Self::CacheUnavailable { .. } => "cache.unavailable",
            Self::QueueFull { .. } => "stream.queue_full",
            Self::StreamClosed { .. } => "stream.closed",
            Self::DeadlineExceeded { .. } => "pipeline.deadline_exceeded",
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Cancelled { .. } => "pipeline.cancelled",
        }
    }

    /// Short, human-readable remediation hints for the failure.
    #[must_use]
    pub fn remediation_hints(&self) -> Vec<&'static str> {
        match self {
            Self::RetrievalUnavailable { .. } => vec![
                "verify the dense and lexical retriever backends are reachable",
                "retry once backend health is restored",
            ],
            Self::RetrieverFailed { .. } => {
                vec!["the other retrieval signal keeps serving this request"]
            }
            Self::EmbeddingFailed { .. } => {
                vec!["check the embedding model; lexical-only retrieval remains available"]
            }
            Self::RerankFailed { .. } => vec!["results are usable without reranking"],
            Self::ProviderFailed { .. } | Self::ProviderTimeout { .. } => {
                vec!["remaining providers are tried automatically"]
            }
            Self::AllProvidersExhausted { .. } => vec![
                "verify provider credentials and quotas",
                "wait for open circuit breakers to cool down",
            ],
            Self::EvaluationFailed { .. } => {
                vec!["the answer is returned with a degraded quality flag"]
            }
            Self::CacheUnavailable { .. } => vec!["requests proceed uncached at higher latency"],
            Self::QueueFull { .. } => vec!["drain the stream faster or raise its capacity"],
            Self::StreamClosed { .. } => vec!["create a new stream per answer"],
            Self::DeadlineExceeded { .. } => {
                vec!["increase the pipeline deadline", "reduce retrieval top_n"]
            }
            Self::InvalidConfig { .. } => vec!["fix the named configuration field"],
            Self::Cancelled { .. } => vec![],
        }
    }

    /// Whether this condition has no remaining fallback and must surface.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RetrievalUnavailable { .. }
                | Self::AllProvidersExhausted { .. }
                | Self::DeadlineExceeded { .. }
                | Self::InvalidConfig { .. }
                | Self::Cancelled { .. }
        )
    }
}

/// Convenience alias used throughout the answersmith crate hierarchy.
pub type PipelineResult<T> = Result<T, PipelineError>;
