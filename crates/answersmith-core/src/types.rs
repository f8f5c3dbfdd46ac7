use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Retrieval types
// ---------------------------------------------------------------------------

/// Which retrieval backend produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetrievalSource {
    /// Dense (embedding similarity) retrieval.
    Dense,
    /// Lexical (BM25-family) retrieval.
    Lexical,
}

impl RetrievalSource {
    /// Deterministic ordering priority used as a fusion tie-break.
    /// Lower sorts first: dense outranks lexical at equal score.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Dense => 0,
            Self::Lexical => 1,
        }
    }
}

/// A scored evidence candidate produced by one retriever.
///
/// Immutable once produced. Uniqueness is by `id`; the same `id` may appear
/// in both retriever lists and must be merged, never duplicated, in fused
/// output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique document/chunk identifier (retriever-defined).
    pub id: String,
    /// Evidence text content.
    pub content: String,
    /// Raw retriever score (cosine similarity or BM25; not comparable across
    /// sources, which is why fusion is rank-based).
    pub score: f32,
    /// Which backend produced this candidate.
    pub source: RetrievalSource,
    /// Extensible key-value metadata carried through to consumers.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Candidate {
    /// Creates a candidate with the required fields.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        score: f32,
        source: RetrievalSource,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score,
            source,
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata key-value pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Fusion types
// ---------------------------------------------------------------------------

/// A candidate after reciprocal-rank fusion.
///
/// Fused scores are computed in f64 for precision while accumulating many
/// small `weight/(K+rank+1)` contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedHit {
    /// The merged candidate payload. When an id appeared in both lists the
    /// dense copy's content and metadata are kept.
    pub candidate: Candidate,
    /// Sum of rank-fusion contributions from whichever lists contain the id.
    pub fused_score: f64,
    /// Rank in the dense list, if present (0-based).
    pub dense_rank: Option<usize>,
    /// Rank in the lexical list, if present (0-based).
    pub lexical_rank: Option<usize>,
    /// True if the id appeared in both retriever lists.
    pub in_both_sources: bool,
}

impl FusedHit {
    /// Four-level deterministic ordering for fused results:
    /// 1. Fused score descending
    /// 2. Candidates in both sources preferred
    /// 3. Source priority (dense before lexical)
    /// 4. Lexicographic id ascending (absolute determinism)
    #[must_use]
    pub fn cmp_for_ranking(&self, other: &Self) -> std::cmp::Ordering {
        other
            .fused_score
            .total_cmp(&self.fused_score)
            .then(other.in_both_sources.cmp(&self.in_both_sources))
            .then_with(|| {
                self.candidate
                    .source
                    .priority()
                    .cmp(&other.candidate.source.priority())
            })
            .then_with(|| self.candidate.id.cmp(&other.candidate.id))
    }
}

/// Parameters a fusion run was executed with, carried for cache keying and
/// audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    /// RRF smoothing constant K.
    pub k: f64,
    /// Weight applied to dense-list contributions.
    pub dense_weight: f64,
    /// Weight applied to lexical-list contributions.
    pub lexical_weight: f64,
    /// Output truncation bound.
    pub top_n: usize,
}

impl FusionParams {
    /// Stable textual fingerprint for cache-key derivation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "k={:.3};dw={:.4};lw={:.4};n={}",
            self.k, self.dense_weight, self.lexical_weight, self.top_n
        )
    }
}

/// Ordered fusion output.
///
/// Invariant: `fused_score` is monotonically non-increasing across `hits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedResult {
    /// Fused hits, best first.
    pub hits: Vec<FusedHit>,
    /// The parameters this result was fused with.
    pub params: FusionParams,
}

impl FusedResult {
    /// The fused candidates in order, without fusion bookkeeping.
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.hits.iter().map(|h| h.candidate.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Rerank types
// ---------------------------------------------------------------------------

/// Stage label used when no rerank stage contributed an ordering.
pub const RERANK_STAGE_NONE: &str = "none";

/// A candidate after the reranking chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedHit {
    /// The candidate payload, unchanged by reranking.
    pub candidate: Candidate,
    /// Relevance score assigned by the last stage that scored this hit.
    /// Falls back to the fused score (truncated to f32) when untouched.
    pub rerank_score: f32,
}

/// Ordered reranking output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedResult {
    /// Reranked hits, best first.
    pub hits: Vec<RerankedHit>,
    /// Which chain stage produced the final ordering. `"none"` when every
    /// stage failed and the fused ordering was returned verbatim.
    pub stage_used: String,
}

impl RerankedResult {
    /// The reranked candidates in order.
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        self.hits.iter().map(|h| h.candidate.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Generation types
// ---------------------------------------------------------------------------

/// The closed set of supported language-model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google (Gemini family).
    Google,
    /// OpenAI (GPT family).
    OpenAi,
    /// Anthropic (Claude family).
    Anthropic,
    /// OpenRouter multi-model gateway.
    OpenRouter,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// Sampling parameters for one generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling temperature in [0.0, 1.0].
    pub temperature: f64,
    /// Token budget for the answer.
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// One grounded generation request.
///
/// Constructed fresh per attempt and never mutated in place: each retry
/// derives a new request from the previous one plus quality-gate feedback
/// via [`GenerationRequest::with_adjustment`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The user query.
    pub query: String,
    /// Ordered evidence candidates to ground the answer on.
    pub evidence: Vec<Candidate>,
    /// Provider identifiers to try first, in order. Providers not listed
    /// keep their configured priority order after the hinted ones.
    pub provider_hints: Vec<ProviderKind>,
    /// Sampling parameters.
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Derive the next attempt's request from quality-gate feedback.
    ///
    /// `swap_provider` rotates the hint list left by one; `increase_temperature`
    /// bumps temperature by 0.1 capped at 1.0. Widened retrieval is applied by
    /// the coordinator (new evidence), not here.
    #[must_use]
    pub fn with_adjustment(&self, adjustment: &QualityAdjustment) -> Self {
        let mut next = self.clone();
        if adjustment.swap_provider && next.provider_hints.len() > 1 {
            next.provider_hints.rotate_left(1);
        }
        if adjustment.increase_temperature {
            next.params.temperature = (next.params.temperature + 0.1).min(1.0);
        }
        next
    }
}

/// A successful generation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The generated answer text.
    pub text: String,
    /// Identifier of the provider that produced the answer.
    pub provider_used: String,
    /// Tokens consumed by the attempt.
    pub tokens_used: u64,
    /// Wall-clock latency of the attempt.
    pub latency: Duration,
}

// ---------------------------------------------------------------------------
// Quality types
// ---------------------------------------------------------------------------

/// Why the evaluator accepted or rejected an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    /// Answer is grounded in the evidence and relevant to the query.
    Grounded,
    /// Answer is insufficiently supported by the evidence.
    LowGroundedness,
    /// Answer does not address the query.
    LowRelevance,
}

/// Retrieval/generation parameter adjustments suggested for a retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityAdjustment {
    /// Widen retrieval `top_n` on the next attempt.
    pub widen_retrieval: bool,
    /// Move the lead provider to the back of the hint list.
    pub swap_provider: bool,
    /// Raise sampling temperature on the next attempt.
    pub increase_temperature: bool,
}

/// The evaluator's verdict on one candidate answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityEvaluation {
    /// Whether the answer clears the groundedness/relevance bar.
    pub accepted: bool,
    /// Evaluator score in [0.0, 1.0]; higher is better.
    pub score: f64,
    /// Why the answer was accepted or rejected.
    pub reason: QualityReason,
    /// Suggested retry adjustment, when rejected.
    pub adjustment: Option<QualityAdjustment>,
}

/// Honest labeling of the returned answer's quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// The evaluator accepted this answer.
    Accepted,
    /// Retry budget was exhausted; this is the best-scoring attempt.
    BestEffort,
    /// Evaluation or the deadline was cut short; the answer is unvetted.
    Degraded,
}

// ---------------------------------------------------------------------------
// Pipeline output
// ---------------------------------------------------------------------------

/// The externally-visible result of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineAnswer {
    /// The answer text.
    pub text: String,
    /// The evidence the answer was grounded on, in rerank order.
    pub evidence: Vec<Candidate>,
    /// Identifier of the provider that produced the answer.
    pub provider_used: String,
    /// Honest quality labeling (accepted / best-effort / degraded).
    pub quality: QualityFlag,
    /// Tokens consumed by the delivered generation attempt.
    pub tokens_used: u64,
    /// How many generation attempts were made.
    pub attempts: u32,
    /// Whether the answer was served from the result cache.
    pub from_cache: bool,
    /// Stage-by-stage execution trace, when requested.
    pub trace: Option<crate::trace::PipelineTrace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64, source: RetrievalSource, both: bool) -> FusedHit {
        FusedHit {
            candidate: Candidate::new(id, format!("content {id}"), 0.5, source),
            fused_score: score,
            dense_rank: None,
            lexical_rank: None,
            in_both_sources: both,
        }
    }

    #[test]
    fn candidate_builder() {
        let c = Candidate::new("doc-1", "hello", 0.9, RetrievalSource::Dense)
            .with_metadata("lang", "en");
        assert_eq!(c.id, "doc-1");
        assert_eq!(c.metadata.get("lang").map(String::as_str), Some("en"));
    }

    #[test]
    fn candidate_serde_roundtrip() {
        let c = Candidate::new("doc-7", "text", 4.2, RetrievalSource::Lexical)
            .with_metadata("src", "wiki");
        let json = serde_json::to_string(&c).expect("serialize");
        let rt: Candidate = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt, c);
    }

    #[test]
    fn fused_score_dominates_ordering() {
        let high = hit("z", 0.03, RetrievalSource::Lexical, false);
        let low = hit("a", 0.01, RetrievalSource::Dense, true);
        assert_eq!(high.cmp_for_ranking(&low), std::cmp::Ordering::Less);
    }

    #[test]
    fn both_sources_preferred_on_tie() {
        let both = hit("z", 0.02, RetrievalSource::Lexical, true);
        let single = hit("a", 0.02, RetrievalSource::Dense, false);
        assert_eq!(both.cmp_for_ranking(&single), std::cmp::Ordering::Less);
    }

    #[test]
    fn dense_preferred_on_source_tiebreak() {
        let dense = hit("z", 0.02, RetrievalSource::Dense, false);
        let lexical = hit("a", 0.02, RetrievalSource::Lexical, false);
        assert_eq!(dense.cmp_for_ranking(&lexical), std::cmp::Ordering::Less);
    }

    #[test]
    fn id_tiebreak_is_lexicographic() {
        let alpha = hit("alpha", 0.02, RetrievalSource::Dense, false);
        let beta = hit("beta", 0.02, RetrievalSource::Dense, false);
        assert_eq!(alpha.cmp_for_ranking(&beta), std::cmp::Ordering::Less);
    }

    #[test]
    fn fusion_params_fingerprint_is_stable() {
        let params = FusionParams {
            k: 60.0,
            dense_weight: 0.5,
            lexical_weight: 0.5,
            top_n: 10,
        };
        assert_eq!(params.fingerprint(), params.fingerprint());
        let widened = FusionParams {
            top_n: 20,
            ..params.clone()
        };
        assert_ne!(params.fingerprint(), widened.fingerprint());
    }

    #[test]
    fn provider_kind_display() {
        assert_eq!(ProviderKind::Google.to_string(), "google");
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        assert_eq!(ProviderKind::Anthropic.to_string(), "anthropic");
        assert_eq!(ProviderKind::OpenRouter.to_string(), "openrouter");
    }

    #[test]
    fn provider_kind_serde_roundtrip() {
        for kind in [
            ProviderKind::Google,
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::OpenRouter,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let decoded: ProviderKind = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, kind);
        }
    }

    #[test]
    fn adjustment_rotates_provider_hints() {
        let request = GenerationRequest {
            query: "q".into(),
            evidence: vec![],
            provider_hints: vec![
                ProviderKind::Anthropic,
                ProviderKind::OpenAi,
                ProviderKind::Google,
            ],
            params: GenerationParams::default(),
        };
        let next = request.with_adjustment(&QualityAdjustment {
            swap_provider: true,
            ..QualityAdjustment::default()
        });
        assert_eq!(
            next.provider_hints,
            vec![
                ProviderKind::OpenAi,
                ProviderKind::Google,
                ProviderKind::Anthropic,
            ]
        );
        // The original request is untouched.
        assert_eq!(request.provider_hints[0], ProviderKind::Anthropic);
    }

    #[test]
    fn adjustment_bumps_temperature_capped() {
        let request = GenerationRequest {
            query: "q".into(),
            evidence: vec![],
            provider_hints: vec![ProviderKind::OpenAi],
            params: GenerationParams {
                temperature: 0.95,
                max_tokens: 256,
            },
        };
        let adj = QualityAdjustment {
            increase_temperature: true,
            ..QualityAdjustment::default()
        };
        let next = request.with_adjustment(&adj);
        assert!((next.params.temperature - 1.0).abs() < 1e-9);
        let again = next.with_adjustment(&adj);
        assert!((again.params.temperature - 1.0).abs() < 1e-9);
    }

    #[test]
    fn adjustment_with_single_hint_does_not_rotate() {
        let request = GenerationRequest {
            query: "q".into(),
            evidence: vec![],
            provider_hints: vec![ProviderKind::Google],
            params: GenerationParams::default(),
        };
        let next = request.with_adjustment(&QualityAdjustment {
            swap_provider: true,
            ..QualityAdjustment::default()
        });
        assert_eq!(next.provider_hints, vec![ProviderKind::Google]);
    }

    #[test]
    fn fused_result_candidates_preserve_order() {
        let result = FusedResult {
            hits: vec![
                hit("b", 0.03, RetrievalSource::Dense, true),
                hit("a", 0.02, RetrievalSource::Lexical, false),
            ],
            params: FusionParams {
                k: 60.0,
                dense_weight: 0.5,
                lexical_weight: 0.5,
                top_n: 10,
            },
        };
        let ids: Vec<String> = result.candidates().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn quality_evaluation_serde_roundtrip() {
        let eval = QualityEvaluation {
            accepted: false,
            score: 0.42,
            reason: QualityReason::LowGroundedness,
            adjustment: Some(QualityAdjustment {
                widen_retrieval: true,
                swap_provider: false,
                increase_temperature: false,
            }),
        };
        let json = serde_json::to_string(&eval).unwrap();
        let rt: QualityEvaluation = serde_json::from_str(&json).unwrap();
        assert!(!rt.accepted);
        assert!((rt.score - 0.42).abs() < f64::EPSILON);
        assert_eq!(rt.reason, QualityReason::LowGroundedness);
        assert!(rt.adjustment.expect("adjustment").widen_retrieval);
    }

    #[test]
    fn pipeline_answer_serde_roundtrip() {
        let answer = PipelineAnswer {
            text: "grounded answer".into(),
            evidence: vec![Candidate::new("e1", "evidence", 0.8, RetrievalSource::Dense)],
            provider_used: "anthropic".into(),
            quality: QualityFlag::BestEffort,
            tokens_used: 512,
            attempts: 3,
            from_cache: false,
            trace: None,
        };
        let json = serde_json::to_string(&answer).unwrap();
        let rt: PipelineAnswer = serde_json::from_str(&json).unwrap();
        assert_eq!(rt.quality, QualityFlag::BestEffort);
        assert_eq!(rt.attempts, 3);
        assert_eq!(rt.evidence.len(), 1);
    }

    #[test]
    fn generation_result_serde_roundtrip() {
        let result = GenerationResult {
            text: "answer".into(),
            provider_used: "openai".into(),
            tokens_used: 321,
            latency: Duration::from_millis(840),
        };
        let json = serde_json::to_string(&result).unwrap();
        let rt: GenerationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(rt.tokens_used, 321);
        assert_eq!(rt.latency, Duration::from_millis(840));
    }
}
