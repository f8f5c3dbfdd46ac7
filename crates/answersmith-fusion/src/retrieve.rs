//! Parallel dense + lexical retrieval fan-out.
//!
//! [`HybridRetriever`] embeds the query once, then issues the dense and
//! lexical searches concurrently and joins them before fusion. Each source
//! runs under its own timeout; one side failing or timing out degrades to
//! single-source retrieval. Only both sides failing is fatal
//! ([`PipelineError::RetrievalUnavailable`]) — there is no evidence left to
//! reason about.

use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use asupersync::Cx;
use asupersync::time::{timeout, wall_now};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use answersmith_core::{
    Candidate, DenseRetriever, Embedder, LexicalRetriever, PipelineError, PipelineResult,
    RetrievalSource,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Configuration for the retrieval fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Per-source timeout budget in milliseconds. Default: 2000.
    pub per_source_timeout_ms: u64,
    /// Fetch `candidate_multiplier × top_n` candidates from each source
    /// before fusion. Default: 3.
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_ms: 2_000,
            candidate_multiplier: 3,
        }
    }
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// Joined output of one retrieval fan-out.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Dense results, ordered descending by similarity. Empty when the dense
    /// side was unavailable.
    pub dense: Vec<Candidate>,
    /// Lexical results, ordered descending by relevance. Empty when the
    /// lexical side was unavailable.
    pub lexical: Vec<Candidate>,
    /// The query embedding, when embedding succeeded. Reused by the cache's
    /// similarity path.
    pub query_embedding: Option<Vec<f32>>,
    /// Why the dense side produced nothing, when it failed.
    pub dense_note: Option<String>,
    /// Why the lexical side produced nothing, when it failed.
    pub lexical_note: Option<String>,
}

#[derive(Debug)]
enum SourceCompletion {
    Completed {
        source: RetrievalSource,
        hits: Vec<Candidate>,
    },
    Failed {
        source: RetrievalSource,
        error: PipelineError,
    },
    TimedOut {
        source: RetrievalSource,
    },
    Cancelled {
        phase: String,
        reason: String,
    },
}

type SourceFuture<'a> = Pin<Box<dyn Future<Output = SourceCompletion> + Send + 'a>>;

// ─── HybridRetriever ────────────────────────────────────────────────────────

/// Uniform read access to the dense and lexical retrieval signals.
pub struct HybridRetriever {
    dense: Arc<dyn DenseRetriever>,
    lexical: Arc<dyn LexicalRetriever>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl std::fmt::Debug for HybridRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRetriever")
            .field("dense", &self.dense.id())
            .field("lexical", &self.lexical.id())
            .field("embedder", &self.embedder.id())
            .field("config", &self.config)
            .finish()
    }
}

impl HybridRetriever {
    /// Create a retriever over the two signal backends and the query embedder.
    #[must_use]
    pub fn new(
        dense: Arc<dyn DenseRetriever>,
        lexical: Arc<dyn LexicalRetriever>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            dense,
            lexical,
            embedder,
            config,
        }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embed the query text.
    ///
    /// # Errors
    ///
    /// Returns the embedder's error unchanged.
    pub async fn embed_query(&self, cx: &Cx, query: &str) -> PipelineResult<Vec<f32>> {
        self.embedder.embed(cx, query).await
    }

    /// Run dense and lexical retrieval in parallel and join the results.
    ///
    /// `query_embedding` may be precomputed (the coordinator embeds before
    /// its similarity cache lookup); when `None`, the query is embedded here.
    /// An embedding failure disables the dense side only.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RetrievalUnavailable`] when both sides fail,
    /// and [`PipelineError::Cancelled`] on cancellation.
    #[instrument(
        name = "answersmith::retrieve",
        skip_all,
        fields(query_len = query.len(), per_source_limit)
    )]
    pub async fn retrieve(
        &self,
        cx: &Cx,
        query: &str,
        per_source_limit: usize,
        query_embedding: Option<Vec<f32>>,
    ) -> PipelineResult<RetrievalOutcome> {
        if query.is_empty() || per_source_limit == 0 {
            return Ok(RetrievalOutcome {
                dense: Vec::new(),
                lexical: Vec::new(),
                query_embedding,
                dense_note: None,
                lexical_note: None,
            });
        }

        // Embed once, up front. Failure disables the dense side only.
        let (query_embedding, embed_note) = match query_embedding {
            Some(vec) => (Some(vec), None),
            None => match self.embedder.embed(cx, query).await {
                Ok(vec) => (Some(vec), None),
                Err(PipelineError::Cancelled { phase, reason }) => {
                    return Err(PipelineError::Cancelled { phase, reason });
                }
                Err(err) => {
                    warn!(
                        target: "answersmith.retrieve",
                        error = %err,
                        "query embedding failed; dense retrieval disabled"
                    );
                    (None, Some(err.to_string()))
                }
            },
        };

        let timeout_budget = Duration::from_millis(self.config.per_source_timeout_ms);
        let mut pending: Vec<SourceFuture<'_>> = Vec::with_capacity(2);

        if let Some(ref embedding) = query_embedding {
            let dense = Arc::clone(&self.dense);
            let embedding = embedding.clone();
            pending.push(Box::pin(async move {
                let timeout_start = cx
                    .timer_driver()
                    .as_ref()
                    .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
                let future = Box::pin(async move { dense.search(cx, &embedding, per_source_limit).await });
                match timeout(timeout_start, timeout_budget, future).await {
                    Ok(Ok(hits)) => SourceCompletion::Completed {
                        source: RetrievalSource::Dense,
                        hits,
                    },
                    Ok(Err(PipelineError::Cancelled { phase, reason })) => {
                        SourceCompletion::Cancelled { phase, reason }
                    }
                    Ok(Err(error)) => SourceCompletion::Failed {
                        source: RetrievalSource::Dense,
                        error,
                    },
                    Err(_elapsed) => SourceCompletion::TimedOut {
                        source: RetrievalSource::Dense,
                    },
                }
            }) as SourceFuture<'_>);
        }

        {
            let lexical = Arc::clone(&self.lexical);
            pending.push(Box::pin(async move {
                let timeout_start = cx
                    .timer_driver()
                    .as_ref()
                    .map_or_else(wall_now, asupersync::time::TimerDriverHandle::now);
                let future = Box::pin(async move { lexical.search(cx, query, per_source_limit).await });
                match timeout(timeout_start, timeout_budget, future).await {
                    Ok(Ok(hits)) => SourceCompletion::Completed {
                        source: RetrievalSource::Lexical,
                        hits,
                    },
                    Ok(Err(PipelineError::Cancelled { phase, reason })) => {
                        SourceCompletion::Cancelled { phase, reason }
                    }
                    Ok(Err(error)) => SourceCompletion::Failed {
                        source: RetrievalSource::Lexical,
                        error,
                    },
                    Err(_elapsed) => SourceCompletion::TimedOut {
                        source: RetrievalSource::Lexical,
                    },
                }
            }) as SourceFuture<'_>);
        }

        let mut outcome = RetrievalOutcome {
            dense: Vec::new(),
            lexical: Vec::new(),
            query_embedding,
            dense_note: embed_note,
            lexical_note: None,
        };

        // Join both sides: poll every pending future each wakeup, harvesting
        // completions as they land.
        while !pending.is_empty() {
            let ready_batch = poll_fn(|task_cx| {
                let mut ready = Vec::new();
                let mut idx = 0;
                while idx < pending.len() {
                    if let Poll::Ready(completion) = pending[idx].as_mut().poll(task_cx) {
                        ready.push(completion);
                        drop(pending.swap_remove(idx));
                    } else {
                        idx += 1;
                    }
                }
                if ready.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(ready)
                }
            })
            .await;

            for completion in ready_batch {
                match completion {
                    SourceCompletion::Completed { source, hits } => {
                        debug!(
                            target: "answersmith.retrieve",
                            source = ?source,
                            hit_count = hits.len(),
                            "retrieval source completed"
                        );
                        match source {
                            RetrievalSource::Dense => outcome.dense = hits,
                            RetrievalSource::Lexical => outcome.lexical = hits,
                        }
                    }
                    SourceCompletion::Cancelled { phase, reason } => {
                        return Err(PipelineError::Cancelled { phase, reason });
                    }
                    SourceCompletion::Failed { source, error } => {
                        warn!(
                            target: "answersmith.retrieve",
                            source = ?source,
                            error = %error,
                            "retrieval source failed; continuing with the other signal"
                        );
                        match source {
                            RetrievalSource::Dense => outcome.dense_note = Some(error.to_string()),
                            RetrievalSource::Lexical => {
                                outcome.lexical_note = Some(error.to_string());
                            }
                        }
                    }
                    SourceCompletion::TimedOut { source } => {
                        warn!(
                            target: "answersmith.retrieve",
                            source = ?source,
                            timeout_ms = self.config.per_source_timeout_ms,
                            "retrieval source timed out; continuing with the other signal"
                        );
                        let note = format!(
                            "timed out after {}ms",
                            self.config.per_source_timeout_ms
                        );
                        match source {
                            RetrievalSource::Dense => outcome.dense_note = Some(note),
                            RetrievalSource::Lexical => outcome.lexical_note = Some(note),
                        }
                    }
                }
            }
        }

        if outcome.dense.is_empty()
            && outcome.lexical.is_empty()
            && (outcome.dense_note.is_some() || outcome.lexical_note.is_some())
        {
            return Err(PipelineError::RetrievalUnavailable {
                dense: outcome
                    .dense_note
                    .unwrap_or_else(|| "no results".to_owned()),
                lexical: outcome
                    .lexical_note
                    .unwrap_or_else(|| "no results".to_owned()),
            });
        }

        Ok(outcome)
    }
}
