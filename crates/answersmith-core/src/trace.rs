//! Optional per-request execution trace.
//!
//! A [`PipelineTrace`] is built only when the caller requests tracing; it is
//! never required for correctness and is owned by the caller after the
//! pipeline returns.

use serde::{Deserialize, Serialize};

/// One stage entry in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    /// Stage name (e.g. `"retrieve"`, `"fuse"`, `"generate[anthropic]"`).
    pub stage: String,
    /// Wall-clock duration in milliseconds (f64 for sub-millisecond precision).
    pub duration_ms: f64,
    /// Short input/output summary (counts, ids, outcome).
    pub summary: String,
}

/// Append-only list of stage entries for one pipeline invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineTrace {
    entries: Vec<StageTrace>,
}

impl PipelineTrace {
    /// Create an empty trace.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append one stage entry.
    pub fn record(&mut self, stage: impl Into<String>, duration_ms: f64, summary: impl Into<String>) {
        self.entries.push(StageTrace {
            stage: stage.into(),
            duration_ms,
            summary: summary.into(),
        });
    }

    /// The recorded entries, in execution order.
    #[must_use]
    pub fn entries(&self) -> &[StageTrace] {
        &self.entries
    }

    /// Number of entries recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries whose stage name starts with `prefix`.
    #[must_use]
    pub fn count_stage(&self, prefix: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.stage.starts_with(prefix))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_in_order() {
        let mut trace = PipelineTrace::new();
        assert!(trace.is_empty());
        trace.record("retrieve", 12.5, "dense=30 lexical=28");
        trace.record("fuse", 0.8, "fused=40");
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.entries()[0].stage, "retrieve");
        assert_eq!(trace.entries()[1].stage, "fuse");
    }

    #[test]
    fn count_stage_matches_prefix() {
        let mut trace = PipelineTrace::new();
        trace.record("generate[openai]", 900.0, "attempt 1");
        trace.record("evaluate", 40.0, "score=0.4");
        trace.record("generate[anthropic]", 850.0, "attempt 2");
        assert_eq!(trace.count_stage("generate"), 2);
        assert_eq!(trace.count_stage("evaluate"), 1);
        assert_eq!(trace.count_stage("rerank"), 0);
    }

    #[test]
    fn serde_roundtrip() {
        let mut trace = PipelineTrace::new();
        trace.record("fuse", 1.25, "fused=10 overlap=2");
        let json = serde_json::to_string(&trace).unwrap();
        let rt: PipelineTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(rt.len(), 1);
        assert!((rt.entries()[0].duration_ms - 1.25).abs() < f64::EPSILON);
        assert_eq!(rt.entries()[0].summary, "fused=10 overlap=2");
    }
}
