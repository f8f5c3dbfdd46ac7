//! Request-scoped pipeline coordination.
//!
//! [`PipelineCoordinator`] wires cache, retrieval, fusion, reranking,
//! generation, and quality evaluation into one execution per request, and is
//! the only component permitted to re-enter fusion: the quality gate's
//! adjustments (widen retrieval, swap lead provider, raise temperature) feed
//! back into the next attempt here.
//!
//! One overall deadline governs the request. Every stage runs under
//! `min(its own budget, remaining deadline)`; when the deadline or a
//! cancellation fires mid-retry-loop, the best attempt obtained so far is
//! returned flagged [`QualityFlag::Degraded`] instead of an error, mirroring
//! the gate's `Exhausted` terminal state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use asupersync::Cx;
use asupersync::time::{sleep, timeout, wall_now};
use tracing::{debug, instrument, warn};

use answersmith_core::{
    AnswerStream, Candidate, FusionParams, GenerationParams, GenerationRequest, PipelineAnswer,
    PipelineError, PipelineResult, PipelineTrace, ProviderKind, QualityEvaluator, QualityFlag,
};
use answersmith_fusion::{HybridRetriever, QueryCache, cache_key, candidate_count, fuse};
use answersmith_generate::GenerationOrchestrator;
use answersmith_rerank::RerankerChain;

use crate::config::PipelineConfig;
use crate::gate::{GateDirective, QualityGate};

// ─── Request ────────────────────────────────────────────────────────────────

/// One answer request.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    /// The natural-language query.
    pub query: String,
    /// Providers to try first, in order.
    pub provider_hints: Vec<ProviderKind>,
    /// Sampling parameters for generation.
    pub params: GenerationParams,
    /// Override of the configured fusion `top_n`.
    pub top_n: Option<usize>,
    /// Whether to build an execution trace.
    pub trace: bool,
}

impl AnswerRequest {
    /// Create a request with defaults for everything but the query.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            provider_hints: Vec::new(),
            params: GenerationParams::default(),
            top_n: None,
            trace: false,
        }
    }

    /// Set the provider hint list.
    #[must_use]
    pub fn with_provider_hints(mut self, hints: Vec<ProviderKind>) -> Self {
        self.provider_hints = hints;
        self
    }

    /// Set the sampling parameters.
    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Override the fused candidate count.
    #[must_use]
    pub const fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }

    /// Request an execution trace.
    #[must_use]
    pub const fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }
}

/// Generate a stable per-request id for stream correlation and tracing.
fn next_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("answer-{id}")
}

// ─── Coordinator ────────────────────────────────────────────────────────────

/// Wires the pipeline components into one request-scoped execution and owns
/// the quality-gated retry loop.
pub struct PipelineCoordinator {
    retriever: HybridRetriever,
    chain: RerankerChain,
    orchestrator: GenerationOrchestrator,
    evaluator: Arc<dyn QualityEvaluator>,
    cache: QueryCache<PipelineAnswer>,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("retriever", &self.retriever)
            .field("chain", &self.chain)
            .field("orchestrator", &self.orchestrator)
            .field("evaluator", &self.evaluator.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Assemble a coordinator, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when the configuration is
    /// invalid.
    pub fn new(
        retriever: HybridRetriever,
        chain: RerankerChain,
        orchestrator: GenerationOrchestrator,
        evaluator: Arc<dyn QualityEvaluator>,
        config: PipelineConfig,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let cache = QueryCache::new(config.cache)?;
        Ok(Self {
            retriever,
            chain,
            orchestrator,
            evaluator,
            cache,
            config,
        })
    }

    /// The result cache, for diagnostics.
    #[must_use]
    pub const fn cache(&self) -> &QueryCache<PipelineAnswer> {
        &self.cache
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer a query through the full quality-gated pipeline.
    ///
    /// # Errors
    ///
    /// Surfaces only conditions with no remaining fallback:
    /// [`PipelineError::RetrievalUnavailable`],
    /// [`PipelineError::AllProvidersExhausted`] (first attempt),
    /// [`PipelineError::DeadlineExceeded`] (no attempt completed), and
    /// [`PipelineError::Cancelled`].
    #[instrument(name = "answersmith::answer", skip_all, fields(query_len = request.query.len()))]
    pub async fn answer(&self, cx: &Cx, request: &AnswerRequest) -> PipelineResult<PipelineAnswer> {
        let started = Instant::now();
        let mut trace = request.trace.then(PipelineTrace::new);
        let top_n = request.top_n.unwrap_or(self.config.top_n);
        let key = self.request_key(request, top_n);

        // Exact cache path: no embedding needed.
        if let Some(hit) = self.cache.get(&key) {
            record(&mut trace, "cache", started, "exact hit");
            return Ok(from_cache(hit.value, trace));
        }

        // Embed once: dense retrieval and the similarity path share it.
        let embed_start = Instant::now();
        let embedding = match self.retriever.embed_query(cx, &request.query).await {
            Ok(vec) => Some(vec),
            Err(PipelineError::Cancelled { phase, reason }) => {
                return Err(PipelineError::Cancelled { phase, reason });
            }
            Err(err) => {
                warn!(
                    target: "answersmith.pipeline",
                    error = %err,
                    "query embedding failed; similarity cache and dense retrieval disabled"
                );
                None
            }
        };
        record(
            &mut trace,
            "embed",
            embed_start,
            format!("dims={}", embedding.as_ref().map_or(0, Vec::len)),
        );

        if let Some(ref vec) = embedding
            && let Some(hit) = self.cache.get_similar(vec)
        {
            record(&mut trace, "cache", started, "similarity hit");
            return Ok(from_cache(hit.value, trace));
        }

        // Soft single-writer-per-key: when another request is already
        // computing this key, wait briefly for its result before computing.
        let claimed = self.cache.begin_inflight(&key);
        if !claimed {
            if let Some(hit) = self.wait_for_inflight(&key).await {
                record(&mut trace, "cache", started, "hit after in-flight wait");
                return Ok(from_cache(hit, trace));
            }
        }

        let result = self
            .attempt_loop(cx, request, top_n, embedding.clone(), started, &mut trace, None)
            .await;
        if claimed {
            self.cache.end_inflight(&key);
        }

        match result {
            Ok(mut answer) => {
                self.cache.put(&key, embedding, answer.clone());
                answer.trace = trace;
                Ok(answer)
            }
            Err(err) => Err(err),
        }
    }

    /// Answer a query, emitting the ordered event sequence into `stream`:
    /// a start marker, content chunks forwarded as generation produces them,
    /// a sources event, and a terminal `Done` — or a terminal `Error`
    /// carrying the machine-readable reason code.
    ///
    /// The streamed answer is quality-gated after stream completion using
    /// the concatenated text; because streamed tokens cannot be unsent, a
    /// rejected streamed answer is delivered flagged
    /// [`QualityFlag::BestEffort`] rather than silently regenerated.
    ///
    /// # Errors
    ///
    /// Same fatal conditions as [`PipelineCoordinator::answer`]; every fatal
    /// error is also emitted as the stream's terminal error event.
    #[instrument(
        name = "answersmith::answer_streaming",
        skip_all,
        fields(query_len = request.query.len())
    )]
    pub async fn answer_streaming(
        &self,
        cx: &Cx,
        request: &AnswerRequest,
        stream: &AnswerStream,
    ) -> PipelineResult<PipelineAnswer> {
        stream.start(next_request_id())?;
        match self.stream_inner(cx, request, stream).await {
            Ok(answer) => Ok(answer),
            Err(err) => {
                // The terminal error event is best-effort: a full buffer must
                // not mask the underlying failure.
                if stream.error(&err).is_err() {
                    warn!(
                        target: "answersmith.pipeline",
                        reason = err.reason_code(),
                        "failed to emit terminal error event"
                    );
                }
                Err(err)
            }
        }
    }

    async fn stream_inner(
        &self,
        cx: &Cx,
        request: &AnswerRequest,
        stream: &AnswerStream,
    ) -> PipelineResult<PipelineAnswer> {
        let started = Instant::now();
        let mut trace = request.trace.then(PipelineTrace::new);
        let top_n = request.top_n.unwrap_or(self.config.top_n);
        let key = self.request_key(request, top_n);

        // Cached answers stream as a single content chunk.
        if let Some(hit) = self.cache.get(&key) {
            let _ = stream.content(hit.value.text.clone());
            let answer = from_cache(hit.value, trace);
            finish_stream(stream, &answer, started);
            return Ok(answer);
        }

        let embedding = match self.retriever.embed_query(cx, &request.query).await {
            Ok(vec) => Some(vec),
            Err(PipelineError::Cancelled { phase, reason }) => {
                return Err(PipelineError::Cancelled { phase, reason });
            }
            Err(_) => None,
        };
        if let Some(ref vec) = embedding
            && let Some(hit) = self.cache.get_similar(vec)
        {
            let _ = stream.content(hit.value.text.clone());
            let answer = from_cache(hit.value, trace);
            finish_stream(stream, &answer, started);
            return Ok(answer);
        }

        let on_token = |chunk: &str| {
            // Backpressure rejections are tracked in the stream's health
            // counters; a dropped chunk must not abort generation mid-call.
            let _ = stream.content(chunk);
        };
        let mut answer = self
            .attempt_loop(
                cx,
                request,
                top_n,
                embedding.clone(),
                started,
                &mut trace,
                Some(&on_token),
            )
            .await?;
        self.cache.put(&key, embedding, answer.clone());
        finish_stream(stream, &answer, started);
        answer.trace = trace;
        Ok(answer)
    }

    /// The quality-gated retry loop. With `on_token` set, generation streams
    /// and the loop stops after one gated attempt (streamed tokens cannot be
    /// unsent); otherwise the gate drives retries up to its budget.
    #[allow(clippy::too_many_lines, clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        cx: &Cx,
        request: &AnswerRequest,
        base_top_n: usize,
        embedding: Option<Vec<f32>>,
        started: Instant,
        trace: &mut Option<PipelineTrace>,
        on_token: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> PipelineResult<PipelineAnswer> {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let mut gate = QualityGate::new(self.config.gate);
        let mut top_n = base_top_n;
        let mut proto = GenerationRequest {
            query: request.query.clone(),
            evidence: Vec::new(),
            provider_hints: request.provider_hints.clone(),
            params: request.params.clone(),
        };
        let mut evidence: Vec<Candidate> = Vec::new();
        let mut need_retrieval = true;

        loop {
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return self.degraded_fallback(&gate, started, trace);
            };

            if need_retrieval {
                let per_source = candidate_count(top_n, self.config.retrieval.candidate_multiplier);
                let stage_start = Instant::now();
                let outcome = self
                    .retriever
                    .retrieve(cx, &request.query, per_source, embedding.clone())
                    .await?;
                record(
                    trace,
                    "retrieve",
                    stage_start,
                    format!(
                        "dense={} lexical={}",
                        outcome.dense.len(),
                        outcome.lexical.len()
                    ),
                );

                let fuse_start = Instant::now();
                let fused = fuse(&outcome.dense, &outcome.lexical, top_n, &self.config.fusion)?;
                record(trace, "fuse", fuse_start, format!("fused={}", fused.hits.len()));

                let rerank_start = Instant::now();
                let reranked = self.chain.rerank(cx, &request.query, &fused).await?;
                record(
                    trace,
                    "rerank",
                    rerank_start,
                    format!("stage={}", reranked.stage_used),
                );

                evidence = reranked.candidates();
                proto = GenerationRequest {
                    evidence: evidence.clone(),
                    ..proto
                };
                need_retrieval = false;
            }

            // Generation under the remaining overall budget; per-attempt
            // provider budgets are the orchestrator's own concern.
            let gen_start = Instant::now();
            let timeout_start = cx
                .timer_driver()
                .as_ref()
                .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
            let generation = {
                let attempt_request = &proto;
                let future = Box::pin(async {
                    match on_token {
                        Some(sink) => {
                            self.orchestrator
                                .generate_streaming(cx, attempt_request, sink)
                                .await
                        }
                        None => self.orchestrator.generate(cx, attempt_request).await,
                    }
                });
                timeout(timeout_start, remaining, future).await
            };

            let answer = match generation {
                Ok(Ok(result)) => result,
                Ok(Err(PipelineError::Cancelled { phase, reason })) => {
                    return self.cancel_fallback(&gate, trace, phase, reason);
                }
                Ok(Err(err)) => {
                    // Provider exhaustion after an earlier scored attempt
                    // still yields that attempt, honestly flagged.
                    if gate.best_attempt().is_some() {
                        warn!(
                            target: "answersmith.pipeline",
                            error = %err,
                            "retry attempt failed; returning best prior attempt"
                        );
                        return self.degraded_fallback(&gate, started, trace);
                    }
                    return Err(err);
                }
                Err(_elapsed) => {
                    return self.degraded_fallback(&gate, started, trace);
                }
            };
            record(
                trace,
                format!("generate[{}]", answer.provider_used),
                gen_start,
                format!("tokens={}", answer.tokens_used),
            );

            // Evaluate under whatever budget remains.
            let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
                return Ok(build_answer(
                    answer,
                    evidence,
                    QualityFlag::Degraded,
                    gate.attempts() + 1,
                ));
            };
            let eval_start = Instant::now();
            let timeout_start = cx
                .timer_driver()
                .as_ref()
                .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
            let eval_outcome = {
                let future = Box::pin(self.evaluator.evaluate(
                    cx,
                    &request.query,
                    &answer.text,
                    &evidence,
                ));
                timeout(timeout_start, remaining, future).await
            };
            let evaluation = match eval_outcome {
                Ok(Ok(evaluation)) => evaluation,
                Ok(Err(PipelineError::Cancelled { .. })) | Err(_elapsed) => {
                    return Ok(build_answer(
                        answer,
                        evidence,
                        QualityFlag::Degraded,
                        gate.attempts() + 1,
                    ));
                }
                Ok(Err(err)) => {
                    // A broken evaluator must not burn retry budget blind:
                    // deliver the answer unvetted.
                    warn!(
                        target: "answersmith.pipeline",
                        error = %err,
                        "quality evaluation failed; returning unevaluated answer"
                    );
                    return Ok(build_answer(
                        answer,
                        evidence,
                        QualityFlag::Degraded,
                        gate.attempts() + 1,
                    ));
                }
            };
            record(
                trace,
                "evaluate",
                eval_start,
                format!("score={:.3} accepted={}", evaluation.score, evaluation.accepted),
            );

            match gate.observe(answer, evidence.clone(), &evaluation) {
                GateDirective::Accept(attempt) => {
                    return Ok(build_answer(
                        attempt.answer,
                        attempt.evidence,
                        QualityFlag::Accepted,
                        gate.attempts(),
                    ));
                }
                GateDirective::Exhausted(best) => {
                    return Ok(build_answer(
                        best.answer,
                        best.evidence,
                        QualityFlag::BestEffort,
                        gate.attempts(),
                    ));
                }
                GateDirective::Retry(adjustment) => {
                    // Streamed tokens are already with the caller; deliver
                    // what streamed, honestly flagged, instead of retrying.
                    if on_token.is_some() {
                        let best = gate
                            .best_attempt()
                            .cloned()
                            .expect("observed attempt is tracked");
                        return Ok(build_answer(
                            best.answer,
                            best.evidence,
                            QualityFlag::BestEffort,
                            gate.attempts(),
                        ));
                    }
                    debug!(
                        target: "answersmith.pipeline",
                        attempt = gate.attempts(),
                        ?adjustment,
                        "quality gate requested retry"
                    );
                    if adjustment.widen_retrieval {
                        top_n = top_n.saturating_mul(self.config.widen_multiplier);
                        need_retrieval = true;
                    }
                    proto = proto.with_adjustment(&adjustment);
                }
            }
        }
    }

    fn request_key(&self, request: &AnswerRequest, top_n: usize) -> String {
        let params = FusionParams {
            k: self.config.fusion.k,
            dense_weight: self.config.fusion.dense_weight,
            lexical_weight: self.config.fusion.lexical_weight,
            top_n,
        };
        cache_key(&request.query, &params.fingerprint())
    }

    async fn wait_for_inflight(&self, key: &str) -> Option<PipelineAnswer> {
        let budget = Duration::from_millis(self.cache.config().inflight_wait_ms);
        let poll = Duration::from_millis(self.cache.config().inflight_poll_ms.max(1));
        let wait_start = Instant::now();
        while wait_start.elapsed() < budget {
            sleep(wall_now(), poll).await;
            if let Some(hit) = self.cache.get(key) {
                return Some(hit.value);
            }
            if !self.cache.is_inflight(key) {
                break;
            }
        }
        // The other computation did not land in time; a brief duplicate
        // computation is acceptable.
        None
    }

    /// Best-so-far return for a deadline or failed-retry cutoff; an error
    /// only when no attempt ever completed.
    fn degraded_fallback(
        &self,
        gate: &QualityGate,
        started: Instant,
        trace: &mut Option<PipelineTrace>,
    ) -> PipelineResult<PipelineAnswer> {
        if let Some(best) = gate.best_attempt() {
            record(
                trace,
                "degraded",
                started,
                format!("returning best of {} attempts", gate.attempts()),
            );
            return Ok(build_answer(
                best.answer.clone(),
                best.evidence.clone(),
                QualityFlag::Degraded,
                gate.attempts(),
            ));
        }
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        Err(PipelineError::DeadlineExceeded {
            elapsed_ms,
            budget_ms: self.config.deadline_ms,
        })
    }

    fn cancel_fallback(
        &self,
        gate: &QualityGate,
        trace: &mut Option<PipelineTrace>,
        phase: String,
        reason: String,
    ) -> PipelineResult<PipelineAnswer> {
        if let Some(best) = gate.best_attempt() {
            record(
                trace,
                "cancelled",
                Instant::now(),
                format!("returning best of {} attempts", gate.attempts()),
            );
            return Ok(build_answer(
                best.answer.clone(),
                best.evidence.clone(),
                QualityFlag::Degraded,
                gate.attempts(),
            ));
        }
        Err(PipelineError::Cancelled { phase, reason })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn record(
    trace: &mut Option<PipelineTrace>,
    stage: impl Into<String>,
    start: Instant,
    summary: impl Into<String>,
) {
    if let Some(trace) = trace.as_mut() {
        trace.record(stage, start.elapsed().as_secs_f64() * 1000.0, summary);
    }
}

fn build_answer(
    answer: answersmith_core::GenerationResult,
    evidence: Vec<Candidate>,
    quality: QualityFlag,
    attempts: u32,
) -> PipelineAnswer {
    PipelineAnswer {
        text: answer.text,
        evidence,
        provider_used: answer.provider_used,
        quality,
        tokens_used: answer.tokens_used,
        attempts,
        from_cache: false,
        trace: None,
    }
}

fn from_cache(mut answer: PipelineAnswer, trace: Option<PipelineTrace>) -> PipelineAnswer {
    answer.from_cache = true;
    answer.trace = trace;
    answer
}

fn finish_stream(stream: &AnswerStream, answer: &PipelineAnswer, started: Instant) {
    let _ = stream.sources(answer.evidence.clone());
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let _ = stream.done(answer.tokens_used, elapsed_ms, answer.quality);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use answersmith_core::{
        AnswerEvent, Completion, DenseRetriever, Embedder, LexicalRetriever, LlmProvider,
        PipelineFuture, QualityAdjustment, QualityEvaluation, QualityReason, RetrievalSource,
    };
    use answersmith_fusion::RetrievalConfig;

    use super::*;

    // ─── Stub collaborators ─────────────────────────────────────────────

    struct CountingDense {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingDense {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl DenseRetriever for CountingDense {
        fn search<'a>(
            &'a self,
            _cx: &'a Cx,
            _query_embedding: &'a [f32],
            top_k: usize,
        ) -> PipelineFuture<'a, Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(PipelineError::RetrieverFailed {
                        retriever: "counting-dense".into(),
                        source: "offline".into(),
                    });
                }
                Ok((0..top_k.min(4))
                    .map(|i| {
                        Candidate::new(
                            format!("dense-{i}"),
                            format!("dense evidence {i}"),
                            1.0 - i as f32 * 0.1,
                            RetrievalSource::Dense,
                        )
                    })
                    .collect())
            })
        }

        fn id(&self) -> &str {
            "counting-dense"
        }
    }

    struct CountingLexical {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingLexical {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl LexicalRetriever for CountingLexical {
        fn search<'a>(
            &'a self,
            _cx: &'a Cx,
            _query: &'a str,
            top_k: usize,
        ) -> PipelineFuture<'a, Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(PipelineError::RetrieverFailed {
                        retriever: "counting-lexical".into(),
                        source: "missing".into(),
                    });
                }
                Ok((0..top_k.min(3))
                    .map(|i| {
                        Candidate::new(
                            format!("lex-{i}"),
                            format!("lexical evidence {i}"),
                            5.0 - i as f32,
                            RetrievalSource::Lexical,
                        )
                    })
                    .collect())
            })
        }

        fn id(&self) -> &str {
            "counting-lexical"
        }
    }

    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        fn embed<'a>(&'a self, _cx: &'a Cx, _text: &'a str) -> PipelineFuture<'a, Vec<f32>> {
            Box::pin(async { Ok(vec![1.0, 0.0, 0.0, 0.0]) })
        }

        fn dimension(&self) -> usize {
            4
        }

        fn id(&self) -> &str {
            "fixed-embedder"
        }
    }

    struct ScriptedProvider {
        texts: Vec<&'static str>,
        calls: AtomicU32,
        fail: bool,
    }

    impl ScriptedProvider {
        fn answering(texts: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                texts,
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                texts: vec![],
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn complete<'a>(
            &'a self,
            _cx: &'a Cx,
            _prompt: &'a str,
            _params: &'a GenerationParams,
        ) -> PipelineFuture<'a, Completion> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed) as usize;
            let fail = self.fail;
            let text = if self.texts.is_empty() {
                String::new()
            } else {
                (*self.texts[call.min(self.texts.len() - 1)]).to_owned()
            };
            Box::pin(async move {
                if fail {
                    return Err(PipelineError::ProviderFailed {
                        provider: "scripted".into(),
                        source: "intentional test failure".into(),
                    });
                }
                Ok(Completion {
                    text,
                    tokens_used: 20,
                })
            })
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn id(&self) -> &str {
            "scripted-openai"
        }
    }

    struct SlowProvider;

    impl LlmProvider for SlowProvider {
        fn complete<'a>(
            &'a self,
            _cx: &'a Cx,
            _prompt: &'a str,
            _params: &'a GenerationParams,
        ) -> PipelineFuture<'a, Completion> {
            Box::pin(async {
                sleep(wall_now(), Duration::from_millis(200)).await;
                Ok(Completion {
                    text: "too late".into(),
                    tokens_used: 1,
                })
            })
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Google
        }

        fn id(&self) -> &str {
            "slow-google"
        }
    }

    struct ScriptedEvaluator {
        scores: Vec<f64>,
        calls: AtomicU32,
        fail: bool,
    }

    impl ScriptedEvaluator {
        fn scoring(scores: Vec<f64>) -> Arc<Self> {
            Arc::new(Self {
                scores,
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                scores: vec![],
                calls: AtomicU32::new(0),
                fail: true,
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
            let fail = self.fail;
            let score = if self.scores.is_empty() {
                0.0
            } else {
                self.scores[call.min(self.scores.len() - 1)]
            };
            Box::pin(async move {
                if fail {
                    return Err(PipelineError::EvaluationFailed {
                        evaluator: "scripted".into(),
                        source: "intentional test failure".into(),
                    });
                }
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

    // ─── Harness ────────────────────────────────────────────────────────

    struct Harness {
        dense: Arc<CountingDense>,
        lexical: Arc<CountingLexical>,
        provider: Arc<ScriptedProvider>,
        evaluator: Arc<ScriptedEvaluator>,
    }

    fn coordinator_with(
        dense: Arc<CountingDense>,
        lexical: Arc<CountingLexical>,
        providers: Vec<Arc<dyn LlmProvider>>,
        evaluator: Arc<ScriptedEvaluator>,
        config: PipelineConfig,
    ) -> PipelineCoordinator {
        let retriever = HybridRetriever::new(
            dense,
            lexical,
            Arc::new(FixedEmbedder),
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

    fn harness(provider_texts: Vec<&'static str>, eval_scores: Vec<f64>) -> (PipelineCoordinator, Harness) {
        let dense = CountingDense::healthy();
        let lexical = CountingLexical::healthy();
        let provider = ScriptedProvider::answering(provider_texts);
        let evaluator = ScriptedEvaluator::scoring(eval_scores);
        let coordinator = coordinator_with(
            dense.clone(),
            lexical.clone(),
            vec![provider.clone()],
            evaluator.clone(),
            PipelineConfig::default(),
        );
        (
            coordinator,
            Harness {
                dense,
                lexical,
                provider,
                evaluator,
            },
        )
    }

    // ─── Single-shot path ───────────────────────────────────────────────

    #[test]
    fn accepted_on_first_attempt() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, stubs) = harness(vec!["grounded answer"], vec![0.9]);
            let request = AnswerRequest::new("what is rank fusion?");

            let answer = coordinator.answer(&cx, &request).await.expect("answer");
            assert_eq!(answer.text, "grounded answer");
            assert_eq!(answer.quality, QualityFlag::Accepted);
            assert_eq!(answer.attempts, 1);
            assert!(!answer.from_cache);
            assert_eq!(answer.provider_used, "scripted-openai");
            assert!(!answer.evidence.is_empty());
            assert_eq!(stubs.provider.call_count(), 1);
            assert_eq!(stubs.evaluator.call_count(), 1);
        });
    }

    #[test]
    fn low_score_retries_with_widened_retrieval_then_accepts() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, stubs) = harness(vec!["thin answer", "better answer"], vec![0.4, 0.9]);
            let request = AnswerRequest::new("what is rank fusion?").with_trace();

            let answer = coordinator.answer(&cx, &request).await.expect("answer");
            assert_eq!(answer.text, "better answer");
            assert_eq!(answer.quality, QualityFlag::Accepted);
            assert_eq!(answer.attempts, 2);
            // Widened retrieval re-ran the fan-out.
            assert_eq!(stubs.dense.call_count(), 2);
            assert_eq!(stubs.lexical.call_count(), 2);

            let trace = answer.trace.expect("trace requested");
            assert_eq!(trace.count_stage("generate"), 2);
            assert_eq!(trace.count_stage("retrieve"), 2);
            assert_eq!(trace.count_stage("evaluate"), 2);
        });
    }

    #[test]
    fn all_providers_failing_surfaces_exhausted_with_zero_evaluations() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let dense = CountingDense::healthy();
            let lexical = CountingLexical::healthy();
            let evaluator = ScriptedEvaluator::scoring(vec![0.9]);
            let coordinator = coordinator_with(
                dense,
                lexical,
                vec![ScriptedProvider::failing(), ScriptedProvider::failing()],
                evaluator.clone(),
                PipelineConfig::default(),
            );

            let err = coordinator
                .answer(&cx, &AnswerRequest::new("unanswerable"))
                .await
                .expect_err("exhausted");
            assert!(matches!(err, PipelineError::AllProvidersExhausted { .. }));
            // No answer exists, so the quality loop never ran.
            assert_eq!(evaluator.call_count(), 0);
        });
    }

    #[test]
    fn budget_exhaustion_returns_best_scoring_attempt() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, stubs) =
                harness(vec!["first", "second", "third"], vec![0.5, 0.3, 0.4]);
            let request = AnswerRequest::new("hard question");

            let answer = coordinator.answer(&cx, &request).await.expect("answer");
            // Default budget 2 → 3 attempts; best score was the first.
            assert_eq!(answer.attempts, 3);
            assert_eq!(answer.quality, QualityFlag::BestEffort);
            assert_eq!(answer.text, "first");
            assert_eq!(stubs.provider.call_count(), 3);
        });
    }

    #[test]
    fn retrieval_unavailable_is_fatal_before_generation() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let dense = CountingDense::failing();
            let lexical = CountingLexical::failing();
            let provider = ScriptedProvider::answering(vec!["never"]);
            let coordinator = coordinator_with(
                dense,
                lexical,
                vec![provider.clone()],
                ScriptedEvaluator::scoring(vec![0.9]),
                PipelineConfig::default(),
            );

            let err = coordinator
                .answer(&cx, &AnswerRequest::new("query"))
                .await
                .expect_err("no evidence");
            assert!(matches!(err, PipelineError::RetrievalUnavailable { .. }));
            assert_eq!(provider.call_count(), 0);
        });
    }

    #[test]
    fn evaluator_failure_returns_degraded_answer() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let dense = CountingDense::healthy();
            let lexical = CountingLexical::healthy();
            let provider = ScriptedProvider::answering(vec!["unvetted answer"]);
            let evaluator = ScriptedEvaluator::failing();
            let coordinator = coordinator_with(
                dense,
                lexical,
                vec![provider.clone()],
                evaluator,
                PipelineConfig::default(),
            );

            let answer = coordinator
                .answer(&cx, &AnswerRequest::new("query"))
                .await
                .expect("degraded answer");
            assert_eq!(answer.text, "unvetted answer");
            assert_eq!(answer.quality, QualityFlag::Degraded);
            assert_eq!(answer.attempts, 1);
            // The broken evaluator must not burn retry budget.
            assert_eq!(provider.call_count(), 1);
        });
    }

    #[test]
    fn deadline_without_any_attempt_is_an_error() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let config = PipelineConfig {
                deadline_ms: 20,
                ..PipelineConfig::default()
            };
            let coordinator = coordinator_with(
                CountingDense::healthy(),
                CountingLexical::healthy(),
                vec![Arc::new(SlowProvider)],
                ScriptedEvaluator::scoring(vec![0.9]),
                config,
            );

            let err = coordinator
                .answer(&cx, &AnswerRequest::new("query"))
                .await
                .expect_err("deadline");
            assert!(matches!(err, PipelineError::DeadlineExceeded { .. }));
        });
    }

    // ─── Cache behavior ─────────────────────────────────────────────────

    #[test]
    fn identical_query_within_ttl_hits_cache_with_zero_backend_calls() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, stubs) = harness(vec!["cached answer"], vec![0.9]);
            let request = AnswerRequest::new("what is rank fusion?");

            let first = coordinator.answer(&cx, &request).await.expect("first");
            assert!(!first.from_cache);
            assert_eq!(stubs.dense.call_count(), 1);
            assert_eq!(stubs.provider.call_count(), 1);

            let second = coordinator.answer(&cx, &request).await.expect("second");
            assert!(second.from_cache);
            assert_eq!(second.text, "cached answer");
            // Zero additional retriever/generator/evaluator calls.
            assert_eq!(stubs.dense.call_count(), 1);
            assert_eq!(stubs.lexical.call_count(), 1);
            assert_eq!(stubs.provider.call_count(), 1);
            assert_eq!(stubs.evaluator.call_count(), 1);
        });
    }

    #[test]
    fn near_identical_query_hits_similarity_path() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            // FixedEmbedder embeds every text identically, so a reworded
            // query misses the exact key but matches by cosine similarity.
            let (coordinator, stubs) = harness(vec!["cached answer"], vec![0.9]);

            let _ = coordinator
                .answer(&cx, &AnswerRequest::new("what is rank fusion?"))
                .await
                .expect("first");
            let reworded = coordinator
                .answer(&cx, &AnswerRequest::new("explain rank fusion"))
                .await
                .expect("second");

            assert!(reworded.from_cache);
            assert_eq!(reworded.text, "cached answer");
            assert_eq!(stubs.provider.call_count(), 1);
        });
    }

    #[test]
    fn disabled_cache_recomputes_every_request() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let dense = CountingDense::healthy();
            let lexical = CountingLexical::healthy();
            let provider = ScriptedProvider::answering(vec!["answer"]);
            let evaluator = ScriptedEvaluator::scoring(vec![0.9]);
            let mut config = PipelineConfig::default();
            config.cache.enabled = false;
            let coordinator = coordinator_with(
                dense,
                lexical,
                vec![provider.clone()],
                evaluator,
                config,
            );

            let request = AnswerRequest::new("query");
            let first = coordinator.answer(&cx, &request).await.expect("first");
            let second = coordinator.answer(&cx, &request).await.expect("second");
            assert!(!first.from_cache);
            assert!(!second.from_cache);
            assert_eq!(provider.call_count(), 2);
        });
    }

    // ─── Streaming path ─────────────────────────────────────────────────

    #[test]
    fn streaming_emits_ordered_event_sequence() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, _stubs) = harness(vec!["streamed answer"], vec![0.9]);
            let stream = AnswerStream::default();

            let answer = coordinator
                .answer_streaming(&cx, &AnswerRequest::new("query"), &stream)
                .await
                .expect("answer");
            assert_eq!(answer.quality, QualityFlag::Accepted);
            assert!(stream.is_closed());

            let frames = stream.drain(64);
            assert!(matches!(frames[0].event, AnswerEvent::Started { .. }));
            let mut last_content_index = None;
            let mut saw_sources = false;
            for frame in &frames[1..frames.len() - 1] {
                match &frame.event {
                    AnswerEvent::Content { index, .. } => {
                        if let Some(prev) = last_content_index {
                            assert!(*index > prev, "content indices must increase");
                        }
                        last_content_index = Some(*index);
                        assert!(!saw_sources, "content must precede sources");
                    }
                    AnswerEvent::Sources { evidence } => {
                        saw_sources = true;
                        assert!(!evidence.is_empty());
                    }
                    other => panic!("unexpected mid-stream event {other:?}"),
                }
            }
            assert!(saw_sources);
            match &frames.last().expect("terminal").event {
                AnswerEvent::Done {
                    quality,
                    tokens_used,
                    ..
                } => {
                    assert_eq!(*quality, QualityFlag::Accepted);
                    assert_eq!(*tokens_used, 20);
                }
                other => panic!("expected Done terminal, got {other:?}"),
            }

            // Concatenated content equals the delivered answer.
            let streamed: String = frames
                .iter()
                .filter_map(|f| match &f.event {
                    AnswerEvent::Content { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(streamed, "streamed answer");
        });
    }

    #[test]
    fn streaming_failure_emits_terminal_error_event() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let coordinator = coordinator_with(
                CountingDense::failing(),
                CountingLexical::failing(),
                vec![ScriptedProvider::answering(vec!["never"])],
                ScriptedEvaluator::scoring(vec![0.9]),
                PipelineConfig::default(),
            );
            let stream = AnswerStream::default();

            let err = coordinator
                .answer_streaming(&cx, &AnswerRequest::new("query"), &stream)
                .await
                .expect_err("fatal");
            assert!(matches!(err, PipelineError::RetrievalUnavailable { .. }));
            assert!(stream.is_closed());

            let frames = stream.drain(16);
            match &frames.last().expect("terminal").event {
                AnswerEvent::Error {
                    reason_code, hints, ..
                } => {
                    assert_eq!(reason_code, "retrieval.unavailable");
                    assert!(!hints.is_empty());
                }
                other => panic!("expected Error terminal, got {other:?}"),
            }
        });
    }

    #[test]
    fn streaming_rejected_answer_is_delivered_best_effort() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            // Streamed tokens cannot be unsent, so a rejected streamed
            // answer is labeled rather than silently regenerated.
            let (coordinator, stubs) = harness(vec!["weak answer"], vec![0.2]);
            let stream = AnswerStream::default();

            let answer = coordinator
                .answer_streaming(&cx, &AnswerRequest::new("query"), &stream)
                .await
                .expect("best effort");
            assert_eq!(answer.quality, QualityFlag::BestEffort);
            assert_eq!(answer.attempts, 1);
            assert_eq!(stubs.provider.call_count(), 1);
        });
    }

    #[test]
    fn streaming_cache_hit_replays_answer_as_single_chunk() {
        asupersync::test_utils::run_test_with_cx(|cx| async move {
            let (coordinator, stubs) = harness(vec!["cached answer"], vec![0.9]);
            let request = AnswerRequest::new("query");

            let _ = coordinator.answer(&cx, &request).await.expect("warm");
            let stream = AnswerStream::default();
            let answer = coordinator
                .answer_streaming(&cx, &request, &stream)
                .await
                .expect("cached");
            assert!(answer.from_cache);
            assert_eq!(stubs.provider.call_count(), 1);

            let frames = stream.drain(16);
            let contents: Vec<&str> = frames
                .iter()
                .filter_map(|f| match &f.event {
                    AnswerEvent::Content { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(contents, vec!["cached answer"]);
            assert!(matches!(
                frames.last().expect("terminal").event,
                AnswerEvent::Done { .. }
            ));
        });
    }

    // ─── Request builder ────────────────────────────────────────────────

    #[test]
    fn request_builder_sets_fields() {
        let request = AnswerRequest::new("q")
            .with_provider_hints(vec![ProviderKind::Anthropic])
            .with_top_n(7)
            .with_trace();
        assert_eq!(request.provider_hints, vec![ProviderKind::Anthropic]);
        assert_eq!(request.top_n, Some(7));
        assert!(request.trace);
    }
}
