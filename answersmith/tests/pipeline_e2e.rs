//! Cross-component scenarios exercising the full answer pipeline with stub
//! collaborators: fusion ordering, provider exhaustion, quality-gated retry,
//! caching, and circuit breaking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use answersmith::{
    AnswerRequest, BreakerConfig, Candidate, Completion, Cx, DenseRetriever, Embedder,
    FusionConfig, GenerationConfig, GenerationOrchestrator, GenerationParams, HybridRetriever,
    LexicalRetriever, LlmProvider, PipelineConfig, PipelineCoordinator, PipelineError,
    PipelineFuture, ProviderKind, QualityAdjustment, QualityEvaluation, QualityEvaluator,
    QualityFlag, QualityReason, RerankerChain, RetrievalConfig, RetrievalSource, fuse,
};

// ─── Stub collaborators ─────────────────────────────────────────────────────

/// Dense retriever returning A then B, as in the fusion contract scenario.
struct FixtureDense {
    calls: AtomicU32,
}

impl FixtureDense {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

impl DenseRetriever for FixtureDense {
    fn search<'a>(
        &'a self,
        _cx: &'a Cx,
        _query_embedding: &'a [f32],
        _top_k: usize,
    ) -> PipelineFuture<'a, Vec<Candidate>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Box::pin(async {
            Ok(vec![
                Candidate::new("A", "passage about A", 0.9, RetrievalSource::Dense),
                Candidate::new("B", "passage about B", 0.8, RetrievalSource::Dense),
            ])
        })
    }

    fn id(&self) -> &str {
        "fixture-dense"
    }
}

/// Lexical retriever returning B then C.
struct FixtureLexical {
    calls: AtomicU32,
}

impl FixtureLexical {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

impl LexicalRetriever for FixtureLexical {
    fn search<'a>(
        &'a self,
        _cx: &'a Cx,
        _query: &'a str,
        _top_k: usize,
    ) -> PipelineFuture<'a, Vec<Candidate>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Box::pin(async {
            Ok(vec![
                Candidate::new("B", "keyword passage about B", 5.0, RetrievalSource::Lexical),
                Candidate::new("C", "keyword passage about C", 3.0, RetrievalSource::Lexical),
            ])
        })
    }

    fn id(&self) -> &str {
        "fixture-lexical"
    }
}

struct UnitEmbedder;

impl Embedder for UnitEmbedder {
    fn embed<'a>(&'a self, _cx: &'a Cx, _text: &'a str) -> PipelineFuture<'a, Vec<f32>> {
        Box::pin(async { Ok(vec![1.0, 0.0, 0.0]) })
    }

    fn dimension(&self) -> usize {
        3
    }

    fn id(&self) -> &str {
        "unit-embedder"
    }
}

struct CountingProvider {
    name: &'static str,
    kind: ProviderKind,
    fail: bool,
    calls: AtomicU32,
}

impl CountingProvider {
    fn healthy(name: &'static str, kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            fail: false,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(name: &'static str, kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            fail: true,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl LlmProvider for CountingProvider {
    fn complete<'a>(
        &'a self,
        _cx: &'a Cx,
        _prompt: &'a str,
        _params: &'a GenerationParams,
    ) -> PipelineFuture<'a, Completion> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let fail = self.fail;
        let name = self.name;
        Box::pin(async move {
            if fail {
                Err(PipelineError::ProviderFailed {
                    provider: name.to_owned(),
                    source: "simulated outage".into(),
                })
            } else {
                Ok(Completion {
                    text: format!("grounded answer via {name}"),
                    tokens_used: 64,
                })
            }
        })
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn id(&self) -> &str {
        self.name
    }
}

/// Evaluator scripted with one score per attempt (last score repeats).
struct ScriptedEvaluator {
    scores: Vec<f64>,
    calls: AtomicU32,
}

impl ScriptedEvaluator {
    fn scoring(scores: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            scores,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl QualityEvaluator for ScriptedEvaluator {
    fn evaluate<'a>(
        &'a self,
        _cx: &'a Cx,
        _query: &'a str,
        _answer: &'a str,
        _evidence: &'a [Candidate],
    ) -> PipelineFuture<'a, QualityEvaluation> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) as usize;
        let score = self.scores[call.min(self.scores.len() - 1)];
        Box::pin(async move {
            Ok(QualityEvaluation {
                accepted: score >= 0.7,
                score,
                reason: if score >= 0.7 {
                    QualityReason::Grounded
                } else {
                    QualityReason::LowGroundedness
                },
                adjustment: (score < 0.7).then_some(QualityAdjustment {
                    widen_retrieval: true,
                    swap_provider: false,
                    increase_temperature: false,
                }),
            })
        })
    }

    fn id(&self) -> &str {
        "scripted-evaluator"
    }
}

fn coordinator(
    dense: Arc<FixtureDense>,
    lexical: Arc<FixtureLexical>,
    providers: Vec<Arc<dyn LlmProvider>>,
    evaluator: Arc<ScriptedEvaluator>,
    config: PipelineConfig,
) -> PipelineCoordinator {
    let retriever = HybridRetriever::new(
        dense,
        lexical,
        Arc::new(UnitEmbedder),
        RetrievalConfig::default(),
    );
    let orchestrator = GenerationOrchestrator::new(providers, config.generation.clone());
    PipelineCoordinator::new(
        retriever,
        RerankerChain::new(),
        orchestrator,
        evaluator,
        config,
    )
    .expect("valid config")
}

// ─── Scenario 1: fusion ordering ────────────────────────────────────────────

#[test]
fn fusion_orders_b_before_a_before_c() {
    // Dense [A(0.9), B(0.8)], lexical [B(5.0), C(3.0)], k=60:
    // B benefits from both lists and must rank first.
    let dense = vec![
        Candidate::new("A", "about A", 0.9, RetrievalSource::Dense),
        Candidate::new("B", "about B", 0.8, RetrievalSource::Dense),
    ];
    let lexical = vec![
        Candidate::new("B", "about B", 5.0, RetrievalSource::Lexical),
        Candidate::new("C", "about C", 3.0, RetrievalSource::Lexical),
    ];

    let fused = fuse(&dense, &lexical, 10, &FusionConfig::default()).expect("fuse");
    let ids: Vec<&str> = fused.hits.iter().map(|h| h.candidate.id.as_str()).collect();
    assert_eq!(ids, vec!["B", "A", "C"]);
    assert!(fused.hits[0].in_both_sources);
}

#[test]
fn pipeline_evidence_leads_with_dual_source_candidate() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let coordinator = coordinator(
            FixtureDense::new(),
            FixtureLexical::new(),
            vec![CountingProvider::healthy("openai-prod", ProviderKind::OpenAi)],
            ScriptedEvaluator::scoring(vec![0.9]),
            PipelineConfig::default(),
        );

        let answer = coordinator
            .answer(&cx, &AnswerRequest::new("tell me about B"))
            .await
            .expect("answer");
        assert_eq!(answer.evidence[0].id, "B");
        assert_eq!(answer.quality, QualityFlag::Accepted);
    });
}

// ─── Scenario 2: provider exhaustion ────────────────────────────────────────

#[test]
fn all_providers_failing_yields_exhausted_with_zero_quality_retries() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let google = CountingProvider::failing("google-prod", ProviderKind::Google);
        let openai = CountingProvider::failing("openai-prod", ProviderKind::OpenAi);
        let anthropic = CountingProvider::failing("anthropic-prod", ProviderKind::Anthropic);
        let evaluator = ScriptedEvaluator::scoring(vec![0.9]);

        let coordinator = coordinator(
            FixtureDense::new(),
            FixtureLexical::new(),
            vec![google.clone(), openai.clone(), anthropic.clone()],
            evaluator.clone(),
            PipelineConfig::default(),
        );

        let err = coordinator
            .answer(&cx, &AnswerRequest::new("anything"))
            .await
            .expect_err("exhausted");
        match err {
            PipelineError::AllProvidersExhausted { attempted } => {
                assert_eq!(attempted.len(), 3);
            }
            other => panic!("expected AllProvidersExhausted, got {other:?}"),
        }

        // Each provider tried exactly once; no answer, so zero evaluations.
        assert_eq!(google.call_count(), 1);
        assert_eq!(openai.call_count(), 1);
        assert_eq!(anthropic.call_count(), 1);
        assert_eq!(evaluator.call_count(), 0);
    });
}

// ─── Scenario 3: quality-gated retry ────────────────────────────────────────

#[test]
fn rejected_first_answer_retries_wider_and_is_accepted() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let dense = FixtureDense::new();
        let provider = CountingProvider::healthy("anthropic-prod", ProviderKind::Anthropic);
        let evaluator = ScriptedEvaluator::scoring(vec![0.4, 0.9]);

        let coordinator = coordinator(
            dense.clone(),
            FixtureLexical::new(),
            vec![provider.clone()],
            evaluator.clone(),
            PipelineConfig::default(),
        );

        let answer = coordinator
            .answer(&cx, &AnswerRequest::new("needs two tries").with_trace())
            .await
            .expect("answer");

        assert_eq!(answer.quality, QualityFlag::Accepted);
        assert_eq!(answer.attempts, 2);
        assert_eq!(provider.call_count(), 2);
        // The widen adjustment re-entered retrieval.
        assert_eq!(dense.calls.load(Ordering::Relaxed), 2);

        let trace = answer.trace.expect("trace requested");
        assert_eq!(trace.count_stage("generate"), 2);
    });
}

#[test]
fn exhausted_budget_returns_best_effort_within_bound() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let provider = CountingProvider::healthy("openai-prod", ProviderKind::OpenAi);
        let evaluator = ScriptedEvaluator::scoring(vec![0.2]);

        let mut config = PipelineConfig::default();
        config.gate.retry_budget = 2;
        let coordinator = coordinator(
            FixtureDense::new(),
            FixtureLexical::new(),
            vec![provider.clone()],
            evaluator.clone(),
            config,
        );

        let answer = coordinator
            .answer(&cx, &AnswerRequest::new("never good enough"))
            .await
            .expect("best effort");
        assert_eq!(answer.quality, QualityFlag::BestEffort);
        // Termination bound: budget + 1 attempts, never more.
        assert_eq!(answer.attempts, 3);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(evaluator.call_count(), 3);
    });
}

// ─── Scenario 4: caching ────────────────────────────────────────────────────

#[test]
fn repeated_query_within_ttl_is_served_from_cache() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let dense = FixtureDense::new();
        let lexical = FixtureLexical::new();
        let provider = CountingProvider::healthy("openai-prod", ProviderKind::OpenAi);

        let coordinator = coordinator(
            dense.clone(),
            lexical.clone(),
            vec![provider.clone()],
            ScriptedEvaluator::scoring(vec![0.9]),
            PipelineConfig::default(),
        );
        let request = AnswerRequest::new("what is X?");

        let first = coordinator.answer(&cx, &request).await.expect("first");
        assert!(!first.from_cache);

        let second = coordinator.answer(&cx, &request).await.expect("second");
        assert!(second.from_cache);
        assert_eq!(second.text, first.text);

        // Zero additional retriever or generator calls were recorded.
        assert_eq!(dense.calls.load(Ordering::Relaxed), 1);
        assert_eq!(lexical.calls.load(Ordering::Relaxed), 1);
        assert_eq!(provider.call_count(), 1);
    });
}

// ─── Circuit breaking across requests ───────────────────────────────────────

#[test]
fn tripped_breaker_short_circuits_subsequent_requests() {
    asupersync::test_utils::run_test_with_cx(|cx| async move {
        let flaky = CountingProvider::failing("google-prod", ProviderKind::Google);
        let backup = CountingProvider::healthy("anthropic-prod", ProviderKind::Anthropic);

        let mut config = PipelineConfig::default();
        config.generation = GenerationConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 60_000,
                ..BreakerConfig::default()
            },
            ..GenerationConfig::default()
        };
        // Keep every request distinct so the cache never interferes.
        config.cache.enabled = false;
        let coordinator = coordinator(
            FixtureDense::new(),
            FixtureLexical::new(),
            vec![flaky.clone(), backup.clone()],
            ScriptedEvaluator::scoring(vec![0.9]),
            config,
        );

        for i in 0..5 {
            let answer = coordinator
                .answer(&cx, &AnswerRequest::new(format!("query {i}")))
                .await
                .expect("answer via backup");
            assert_eq!(answer.provider_used, "anthropic-prod");
        }

        // Two failures tripped the breaker; the flaky provider was never
        // called again within the cooldown.
        assert_eq!(flaky.call_count(), 2);
        assert_eq!(backup.call_count(), 5);
    });
}
