//! Quality gate: accept, retry, or give up on a generated answer.
//!
//! The gate is a small state machine over `{Evaluating, Accepted, Retrying,
//! Exhausted}`. Every attempt is observed in `Evaluating`; an attempt whose
//! evaluator score clears the accept threshold transitions to `Accepted`. A
//! rejected attempt transitions to `Retrying` while the retry budget lasts,
//! handing back the adjustment to apply; once the budget is spent the gate
//! transitions to `Exhausted` and returns the **best-scoring** attempt seen
//! so far — a terminal, non-error outcome. The loop observing the gate
//! therefore always terminates within `budget + 1` attempts.

use serde::{Deserialize, Serialize};
use tracing::debug;

use answersmith_core::{Candidate, GenerationResult, QualityAdjustment, QualityEvaluation};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Configuration for the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    /// Minimum evaluator score for acceptance. Default: 0.7.
    pub accept_threshold: f64,
    /// Additional attempts allowed after the first. Default: 2.
    pub retry_budget: u32,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.7,
            retry_budget: 2,
        }
    }
}

// ─── State machine ──────────────────────────────────────────────────────────

/// Gate states. `Accepted` and `Exhausted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Waiting to observe an attempt.
    Evaluating,
    /// An attempt cleared the threshold.
    Accepted,
    /// The last attempt was rejected; a retry is in flight.
    Retrying,
    /// The budget is spent; the best attempt so far is the answer.
    Exhausted,
}

/// One observed generation attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// The generation outcome.
    pub answer: GenerationResult,
    /// The evidence the attempt was grounded on.
    pub evidence: Vec<Candidate>,
    /// The evaluator's score for this attempt.
    pub score: f64,
}

/// What the observing loop should do next.
#[derive(Debug, Clone)]
pub enum GateDirective {
    /// Deliver this attempt as accepted.
    Accept(AttemptRecord),
    /// Run another attempt with this adjustment applied.
    Retry(QualityAdjustment),
    /// Budget spent: deliver the best-scoring attempt, flagged best-effort.
    Exhausted(AttemptRecord),
}

/// Quality-gated retry state for one pipeline invocation.
#[derive(Debug)]
pub struct QualityGate {
    config: QualityGateConfig,
    state: GateState,
    attempts: u32,
    best: Option<AttemptRecord>,
}

impl QualityGate {
    /// Create a gate with the given configuration.
    #[must_use]
    pub const fn new(config: QualityGateConfig) -> Self {
        Self {
            config,
            state: GateState::Evaluating,
            attempts: 0,
            best: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> GateState {
        self.state
    }

    /// Number of attempts observed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The best-scoring attempt observed so far, if any.
    #[must_use]
    pub const fn best_attempt(&self) -> Option<&AttemptRecord> {
        self.best.as_ref()
    }

    /// Maximum number of attempts this gate will observe.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.retry_budget + 1
    }

    /// Observe one evaluated attempt and decide what happens next.
    ///
    /// The returned directive is terminal (`Accept`/`Exhausted`) or a
    /// `Retry` carrying the adjustment for the next attempt. A gate already
    /// in a terminal state keeps returning its terminal directive.
    pub fn observe(
        &mut self,
        answer: GenerationResult,
        evidence: Vec<Candidate>,
        evaluation: &QualityEvaluation,
    ) -> GateDirective {
        match self.state {
            GateState::Accepted | GateState::Exhausted => {
                let best = self.best.clone().expect("terminal gate has a best attempt");
                return if self.state == GateState::Accepted {
                    GateDirective::Accept(best)
                } else {
                    GateDirective::Exhausted(best)
                };
            }
            GateState::Evaluating | GateState::Retrying => {}
        }

        self.attempts += 1;
        let attempt = AttemptRecord {
            answer,
            evidence,
            score: evaluation.score,
        };

        // Track the best attempt across the whole loop: on exhaustion the
        // best one is returned, not necessarily the last.
        let is_new_best = self
            .best
            .as_ref()
            .is_none_or(|best| attempt.score > best.score);
        if is_new_best {
            self.best = Some(attempt.clone());
        }

        if evaluation.score >= self.config.accept_threshold {
            self.state = GateState::Accepted;
            debug!(
                target: "answersmith.gate",
                attempt = self.attempts,
                score = evaluation.score,
                "answer accepted"
            );
            return GateDirective::Accept(attempt);
        }

        if self.attempts < self.max_attempts() {
            self.state = GateState::Retrying;
            // An evaluator that rejects without a suggestion gets the
            // canonical fallback: widen retrieval.
            let adjustment = evaluation.adjustment.unwrap_or(QualityAdjustment {
                widen_retrieval: true,
                swap_provider: false,
                increase_temperature: false,
            });
            debug!(
                target: "answersmith.gate",
                attempt = self.attempts,
                score = evaluation.score,
                ?adjustment,
                "answer rejected; retrying"
            );
            return GateDirective::Retry(adjustment);
        }

        self.state = GateState::Exhausted;
        let best = self.best.clone().expect("at least one attempt observed");
        debug!(
            target: "answersmith.gate",
            attempts = self.attempts,
            best_score = best.score,
            "retry budget exhausted; returning best-effort answer"
        );
        GateDirective::Exhausted(best)
    }
}
