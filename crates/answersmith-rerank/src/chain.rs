//! Ordered reranking chain: compose stages, time each out, degrade gracefully.
//!
//! The chain invokes its stages sequentially — each stage consumes the
//! previous stage's ordering, so stages compose rather than compete. Every
//! stage runs under its own timeout and against at most its declared
//! `max_documents` candidates (the working set is truncated before invoking,
//! never erroring on oversize input). A stage failure or timeout skips that
//! stage and passes its unmodified input onward; if every stage fails, the
//! fused ordering is returned verbatim with `stage_used = "none"`.
//!
//! This policy guarantees the chain can never make the pipeline fail
//! outright — it can only fail to improve ordering. Cancellation is the one
//! exception and propagates.

use std::sync::Arc;
use std::time::Duration;

use asupersync::Cx;
use asupersync::time::{timeout, wall_now};
use tracing::{debug, instrument, warn};

use answersmith_core::{
    Candidate, FusedResult, PipelineError, PipelineResult, RERANK_STAGE_NONE, RerankStage,
    RerankedHit, RerankedResult,
};

/// Default per-stage timeout.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 3_000;

struct ChainStage {
    stage: Arc<dyn RerankStage>,
    timeout: Duration,
}

/// Ordered sequence of reranking stages.
#[derive(Default)]
pub struct RerankerChain {
    stages: Vec<ChainStage>,
}

impl std::fmt::Debug for RerankerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.stages.iter().map(|s| s.stage.id()).collect();
        f.debug_struct("RerankerChain").field("stages", &ids).finish()
    }
}

impl RerankerChain {
    /// Create an empty chain. An empty chain returns the fused ordering
    /// verbatim with `stage_used = "none"`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage with the default timeout.
    #[must_use]
    pub fn with_stage(self, stage: Arc<dyn RerankStage>) -> Self {
        self.with_stage_timeout(stage, Duration::from_millis(DEFAULT_STAGE_TIMEOUT_MS))
    }

    /// Append a stage with an explicit timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, stage: Arc<dyn RerankStage>, timeout: Duration) -> Self {
        self.stages.push(ChainStage { stage, timeout });
        self
    }

    /// Number of configured stages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Rerank the fused result through the stage chain.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] when cancelled via `cx`. Every
    /// other stage error is absorbed.
    #[instrument(
        name = "answersmith::rerank",
        skip_all,
        fields(query_len = query.len(), candidates = fused.hits.len(), stages = self.stages.len())
    )]
    pub async fn rerank(
        &self,
        cx: &Cx,
        query: &str,
        fused: &FusedResult,
    ) -> PipelineResult<RerankedResult> {
        // Seed the working set with the fused ordering; fused scores carry
        // over as the baseline rerank scores.
        let mut working: Vec<RerankedHit> = fused
            .hits
            .iter()
            .map(|hit| RerankedHit {
                candidate: hit.candidate.clone(),
                #[allow(clippy::cast_possible_truncation)]
                rerank_score: hit.fused_score as f32,
            })
            .collect();
        let mut stage_used = RERANK_STAGE_NONE.to_owned();

        for entry in &self.stages {
            let head_len = working.len().min(entry.stage.max_documents());
            if head_len == 0 {
                debug!(
                    target: "answersmith.rerank",
                    stage = entry.stage.id(),
                    "skipping stage: no candidates"
                );
                continue;
            }

            let head: Vec<Candidate> = working[..head_len]
                .iter()
                .map(|hit| hit.candidate.clone())
                .collect();

            let timeout_start = cx
                .timer_driver()
                .as_ref()
                .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
            let future = Box::pin(entry.stage.rerank(cx, query, &head));
            let scores = match timeout(timeout_start, entry.timeout, future).await {
                Ok(Ok(scores)) => scores,
                Ok(Err(PipelineError::Cancelled { phase, reason })) => {
                    return Err(PipelineError::Cancelled { phase, reason });
                }
                Ok(Err(err)) => {
                    warn!(
                        target: "answersmith.rerank",
                        stage = entry.stage.id(),
                        error = %err,
                        "stage failed — passing prior ordering to the next stage"
                    );
                    continue;
                }
                Err(_elapsed) => {
                    warn!(
                        target: "answersmith.rerank",
                        stage = entry.stage.id(),
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "stage timed out — passing prior ordering to the next stage"
                    );
                    continue;
                }
            };

            if scores.len() != head_len {
                warn!(
                    target: "answersmith.rerank",
                    stage = entry.stage.id(),
                    expected = head_len,
                    got = scores.len(),
                    "stage score count mismatch — skipping stage"
                );
                continue;
            }

            // Apply scores to the head via original_rank; the stage may have
            // sorted its output, so ranks are the only reliable mapping.
            for score in scores {
                if score.original_rank >= head_len {
                    warn!(
                        target: "answersmith.rerank",
                        stage = entry.stage.id(),
                        rank = score.original_rank,
                        "stage returned original_rank outside its input"
                    );
                    continue;
                }
                if working[score.original_rank].candidate.id != score.id {
                    warn!(
                        target: "answersmith.rerank",
                        stage = entry.stage.id(),
                        expected = %working[score.original_rank].candidate.id,
                        got = %score.id,
                        "stage returned mismatched id for original_rank"
                    );
                }
                working[score.original_rank].rerank_score = score.score;
            }

            // Re-sort the scored head descending (NaN-safe); the untouched
            // tail keeps its prior order.
            working[..head_len].sort_by(|a, b| {
                let sa = sanitize(a.rerank_score);
                let sb = sanitize(b.rerank_score);
                sb.total_cmp(&sa)
                    .then_with(|| a.candidate.id.cmp(&b.candidate.id))
            });

            stage_used = entry.stage.id().to_owned();
            debug!(
                target: "answersmith.rerank",
                stage = %stage_used,
                reranked = head_len,
                terminal = entry.stage.is_terminal(),
                "stage complete"
            );

            if entry.stage.is_terminal() {
                break;
            }
        }

        Ok(RerankedResult {
            hits: working,
            stage_used,
        })
    }
}

#[inline]
const fn sanitize(score: f32) -> f32 {
    if score.is_finite() {
        score
    } else {
        f32::NEG_INFINITY
    }
}
