//! Tracing conventions for answersmith.
//!
//! Consumers bring their own `tracing` subscriber; this module only fixes the
//! target prefix, the canonical span names, and log-level parsing so that
//! spans and events stay filterable across the whole pipeline:
//!
//! ```text
//! RUST_LOG=answersmith=debug
//! ```

use tracing::Level;

/// Target prefix used by all answersmith tracing spans and events.
pub const TARGET_PREFIX: &str = "answersmith";

/// Standard tracing span names used across the pipeline.
///
/// These constants keep span naming consistent so consumers can match on
/// them in subscribers, dashboards, and tests.
pub mod span_names {
    /// Root span for one answer request.
    pub const ANSWER: &str = "answersmith::answer";
    /// Query embedding.
    pub const EMBED: &str = "answersmith::embed";
    /// Parallel dense + lexical retrieval.
    pub const RETRIEVE: &str = "answersmith::retrieve";
    /// Rank fusion step.
    pub const FUSE: &str = "answersmith::fuse";
    /// Reranking chain.
    pub const RERANK: &str = "answersmith::rerank";
    /// Provider-fallback generation.
    pub const GENERATE: &str = "answersmith::generate";
    /// Quality evaluation.
    pub const EVALUATE: &str = "answersmith::evaluate";
    /// Cache lookup/population.
    pub const CACHE: &str = "answersmith::cache";
}

/// Standard structured field names used in tracing events.
pub mod field_names {
    pub const QUERY_LEN: &str = "query_len";
    pub const ATTEMPT: &str = "attempt";
    pub const PROVIDER: &str = "provider";
    pub const STAGE: &str = "stage";
    pub const TOP_N: &str = "top_n";
    pub const DENSE_COUNT: &str = "dense_count";
    pub const LEXICAL_COUNT: &str = "lexical_count";
    pub const FUSED_COUNT: &str = "fused_count";
    pub const OVERLAP_COUNT: &str = "overlap_count";
    pub const SCORE: &str = "score";
    pub const DURATION_MS: &str = "duration_ms";
}

/// Parse a log level string (case-insensitive).
///
/// Recognized values: `trace`, `debug`, `info`, `warn`, `error`.
/// Returns `None` for unrecognized strings.
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Returns the recommended `tracing::Level` for the given environment.
///
/// Checks `ANSWERSMITH_LOG_LEVEL` first, then falls back to the provided
/// default.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    std::env::var("ANSWERSMITH_LOG_LEVEL")
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}
