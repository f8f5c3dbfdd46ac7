//! Provider-fallback generation.
//!
//! [`GenerationOrchestrator`] holds an ordered provider priority list and one
//! shared [`ProviderBreaker`] per provider. A request's `provider_hints`
//! reorder the front of the list; providers are then tried **sequentially**
//! (one model call at a time, to avoid paying for redundant completions),
//! skipping any whose circuit is open, until one succeeds or the list is
//! exhausted. Each attempt runs under its own timeout; a slow provider's
//! budget never extends to shrink the remaining providers' budgets — the
//! overall wall-clock deadline is enforced by the pipeline coordinator, not
//! here.
//!
//! Exhausting every provider yields [`PipelineError::AllProvidersExhausted`]
//! with a per-provider outcome list, never a silently empty answer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use asupersync::Cx;
use asupersync::time::{timeout, wall_now};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use answersmith_core::{
    Candidate, GenerationRequest, GenerationResult, LlmProvider, PipelineError, PipelineResult,
};

use crate::breaker::{BreakerConfig, BreakerDecision, ProviderBreaker};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Configuration for the generation orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Per-attempt timeout in milliseconds. Default: 30,000.
    pub attempt_timeout_ms: u64,
    /// Circuit-breaker configuration applied to every provider.
    pub breaker: BreakerConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 30_000,
            breaker: BreakerConfig::default(),
        }
    }
}

// ─── Prompt assembly ────────────────────────────────────────────────────────

/// Build a grounded prompt from the query and its numbered evidence.
#[must_use]
pub fn build_prompt(query: &str, evidence: &[Candidate]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the numbered evidence passages. \
         Cite passage numbers where relevant.\n\nEvidence:\n",
    );
    for (i, candidate) in evidence.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n", i + 1, candidate.content));
    }
    prompt.push_str(&format!("\nQuestion: {query}\nAnswer:"));
    prompt
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Ordered provider fallback with shared per-provider circuit breakers.
pub struct GenerationOrchestrator {
    providers: Vec<Arc<dyn LlmProvider>>,
    breakers: Vec<Arc<ProviderBreaker>>,
    config: GenerationConfig,
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.providers.iter().map(|p| p.id()).collect();
        f.debug_struct("GenerationOrchestrator")
            .field("providers", &ids)
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationOrchestrator {
    /// Create an orchestrator over providers in configured priority order.
    ///
    /// One breaker is created per provider and shared across every request
    /// through this orchestrator.
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: GenerationConfig) -> Self {
        let breakers = providers
            .iter()
            .map(|_| Arc::new(ProviderBreaker::new(config.breaker.clone())))
            .collect();
        Self {
            providers,
            breakers,
            config,
        }
    }

    /// Number of configured providers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no providers are configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The breaker guarding the provider with this id, for diagnostics.
    #[must_use]
    pub fn breaker_for(&self, provider_id: &str) -> Option<&Arc<ProviderBreaker>> {
        self.providers
            .iter()
            .position(|p| p.id() == provider_id)
            .map(|i| &self.breakers[i])
    }

    /// Generate an answer, trying providers in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AllProvidersExhausted`] when every provider
    /// failed or was circuit-open, and [`PipelineError::Cancelled`] on
    /// cancellation.
    #[instrument(
        name = "answersmith::generate",
        skip_all,
        fields(query_len = request.query.len(), evidence = request.evidence.len())
    )]
    pub async fn generate(
        &self,
        cx: &Cx,
        request: &GenerationRequest,
    ) -> PipelineResult<GenerationResult> {
        self.generate_inner(cx, request, None).await
    }

    /// Generate an answer, forwarding incremental text to `on_token` as it
    /// arrives. The returned result carries the full concatenated text for
    /// post-stream quality gating.
    ///
    /// # Errors
    ///
    /// Same contract as [`GenerationOrchestrator::generate`].
    #[instrument(
        name = "answersmith::generate_streaming",
        skip_all,
        fields(query_len = request.query.len(), evidence = request.evidence.len())
    )]
    pub async fn generate_streaming(
        &self,
        cx: &Cx,
        request: &GenerationRequest,
        on_token: &(dyn Fn(&str) + Send + Sync),
    ) -> PipelineResult<GenerationResult> {
        self.generate_inner(cx, request, Some(on_token)).await
    }

    async fn generate_inner(
        &self,
        cx: &Cx,
        request: &GenerationRequest,
        on_token: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> PipelineResult<GenerationResult> {
        let prompt = build_prompt(&request.query, &request.evidence);
        let attempt_budget = Duration::from_millis(self.config.attempt_timeout_ms);
        let mut attempted: Vec<String> = Vec::new();

        for index in self.provider_order(request) {
            let provider = &self.providers[index];
            let breaker = &self.breakers[index];

            match breaker.check() {
                BreakerDecision::Skip => {
                    debug!(
                        target: "answersmith.generate",
                        provider = provider.id(),
                        "skipping provider: circuit open"
                    );
                    attempted.push(format!("{}: circuit_open", provider.id()));
                    continue;
                }
                BreakerDecision::Allow | BreakerDecision::Probe => {}
            }

            let attempt_start = Instant::now();
            let timeout_start = cx
                .timer_driver()
                .as_ref()
                .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
            let future = Box::pin(async {
                match on_token {
                    Some(sink) => {
                        provider
                            .complete_streaming(cx, &prompt, &request.params, sink)
                            .await
                    }
                    None => provider.complete(cx, &prompt, &request.params).await,
                }
            });

            match timeout(timeout_start, attempt_budget, future).await {
                Ok(Ok(completion)) => {
                    breaker.record_success();
                    let latency = attempt_start.elapsed();
                    debug!(
                        target: "answersmith.generate",
                        provider = provider.id(),
                        tokens = completion.tokens_used,
                        latency_ms = latency.as_millis() as u64,
                        "generation attempt succeeded"
                    );
                    return Ok(GenerationResult {
                        text: completion.text,
                        provider_used: provider.id().to_owned(),
                        tokens_used: completion.tokens_used,
                        latency,
                    });
                }
                Ok(Err(PipelineError::Cancelled { phase, reason })) => {
                    // Cancellation is not a provider fault; leave the breaker
                    // untouched and unwind.
                    return Err(PipelineError::Cancelled { phase, reason });
                }
                Ok(Err(err)) => {
                    breaker.record_failure();
                    warn!(
                        target: "answersmith.generate",
                        provider = provider.id(),
                        error = %err,
                        "generation attempt failed; trying next provider"
                    );
                    attempted.push(format!("{}: {}", provider.id(), err.reason_code()));
                }
                Err(_elapsed) => {
                    breaker.record_failure();
                    #[allow(clippy::cast_possible_truncation)]
                    let err = PipelineError::ProviderTimeout {
                        provider: provider.id().to_owned(),
                        elapsed_ms: attempt_start.elapsed().as_millis() as u64,
                        budget_ms: self.config.attempt_timeout_ms,
                    };
                    warn!(
                        target: "answersmith.generate",
                        provider = provider.id(),
                        error = %err,
                        "generation attempt timed out; trying next provider"
                    );
                    attempted.push(format!("{}: {}", provider.id(), err.reason_code()));
                }
            }
        }

        Err(PipelineError::AllProvidersExhausted { attempted })
    }

    /// Provider indices in attempt order: hinted kinds first (in hint order),
    /// then the remaining providers in configured priority order.
    fn provider_order(&self, request: &GenerationRequest) -> Vec<usize> {
        let mut order: Vec<usize> = Vec::with_capacity(self.providers.len());
        for hint in &request.provider_hints {
            for (i, provider) in self.providers.iter().enumerate() {
                if provider.kind() == *hint && !order.contains(&i) {
                    order.push(i);
                }
            }
        }
        for i in 0..self.providers.len() {
            if !order.contains(&i) {
                order.push(i);
            }
        }
        order
    }
}
