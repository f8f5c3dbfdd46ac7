//! Reciprocal Rank Fusion (RRF) for combining dense and lexical retrieval.
//!
//! RRF is a principled, training-free method for fusing ranked lists from
//! retrieval systems whose raw scores are not comparable (Cormack et al.,
//! 2009). The score for a candidate appearing at rank `r` (0-based) in
//! source `i` is:
//!
//! ```text
//! score(doc) = Σ_i  weight_i / (K + r_i + 1)
//! ```
//!
//! Candidates appearing in both sources get their contributions summed,
//! which naturally boosts dual-source hits. Absence from a list contributes
//! zero, never a penalty.

use std::collections::HashMap;

use answersmith_core::{
    Candidate, FusedHit, FusedResult, FusionParams, PipelineError, PipelineResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

// ─── Configuration ──────────────────────────────────────────────────────────

const DEFAULT_RRF_K: f64 = 60.0;
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Rank-fusion parameters.
///
/// The `k` constant controls how steeply rank affects score: higher K
/// flattens the distribution, lower K makes top ranks much more valuable.
/// K=60 is the empirically optimal value from the original paper. Source
/// weights split the unit contribution between the two lists and must sum
/// to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// RRF constant K. Default: 60.0.
    pub k: f64,
    /// Weight applied to dense-list contributions. Default: 0.5.
    pub dense_weight: f64,
    /// Weight applied to lexical-list contributions. Default: 0.5.
    pub lexical_weight: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            dense_weight: 0.5,
            lexical_weight: 0.5,
        }
    }
}

impl FusionConfig {
    /// Validate the weighting.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when either weight is outside
    /// [0, 1] or the weights do not sum to 1.0.
    pub fn validate(&self) -> PipelineResult<()> {
        for (field, value) in [
            ("fusion.dense_weight", self.dense_weight),
            ("fusion.lexical_weight", self.lexical_weight),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidConfig {
                    field: field.to_owned(),
                    value: value.to_string(),
                    reason: "must be a finite value in [0.0, 1.0]".to_owned(),
                });
            }
        }
        let sum = self.dense_weight + self.lexical_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PipelineError::InvalidConfig {
                field: "fusion.dense_weight + fusion.lexical_weight".to_owned(),
                value: sum.to_string(),
                reason: "source weights must sum to 1.0".to_owned(),
            });
        }
        Ok(())
    }
}

// ─── Candidate budget ───────────────────────────────────────────────────────

/// Compute how many candidates to fetch from each source.
///
/// Fetches `multiplier × limit` to ensure good coverage for candidates that
/// rank differently across sources.
#[must_use]
pub const fn candidate_count(limit: usize, multiplier: usize) -> usize {
    limit.saturating_mul(multiplier)
}

#[inline]
fn rank_contribution(weight: f64, k: f64, rank: usize) -> f64 {
    let rank_u32 = u32::try_from(rank).unwrap_or(u32::MAX);
    weight / (k + f64::from(rank_u32) + 1.0)
}

#[inline]
fn sanitize_rrf_k(k: f64) -> f64 {
    if k.is_finite() && k >= 0.0 {
        k
    } else {
        DEFAULT_RRF_K
    }
}

// ─── RRF fusion ─────────────────────────────────────────────────────────────

/// Fuse dense and lexical retrieval results using weighted RRF.
///
/// # Algorithm
///
/// 1. Assign contributions `weight/(K + rank + 1)` per source (0-based ranks).
/// 2. Sum contributions for candidates appearing in both sources; when an id
///    appears in both lists the dense copy's payload is kept.
/// 3. Sort by the 4-level deterministic ordering on [`FusedHit`]:
///    fused score descending, dual-source preferred, source priority, id
///    ascending.
/// 4. Truncate to `top_n`.
///
/// Either input may be empty (single-source ranking); both empty yields an
/// empty result, not an error.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] when `top_n` is zero or the
/// configured weights fail validation.
#[instrument(
    name = "answersmith::fuse",
    skip(dense, lexical),
    fields(
        dense_count = dense.len(),
        lexical_count = lexical.len(),
        k = config.k,
        top_n,
    )
)]
pub fn fuse(
    dense: &[Candidate],
    lexical: &[Candidate],
    top_n: usize,
    config: &FusionConfig,
) -> PipelineResult<FusedResult> {
    config.validate()?;
    if top_n == 0 {
        return Err(PipelineError::InvalidConfig {
            field: "fusion.top_n".to_owned(),
            value: "0".to_owned(),
            reason: "output bound must be at least 1".to_owned(),
        });
    }

    let k = sanitize_rrf_k(config.k);
    let capacity = dense.len() + lexical.len();
    let mut hits: HashMap<String, FusedHit> = HashMap::with_capacity(capacity);

    // Score the dense list.
    for (rank, candidate) in dense.iter().enumerate() {
        let contribution = rank_contribution(config.dense_weight, k, rank);
        hits.entry(candidate.id.clone())
            .and_modify(|hit| {
                hit.fused_score += contribution;
                hit.dense_rank = Some(rank);
                hit.in_both_sources = true;
            })
            .or_insert_with(|| FusedHit {
                candidate: candidate.clone(),
                fused_score: contribution,
                dense_rank: Some(rank),
                lexical_rank: None,
                in_both_sources: false,
            });
    }

    // Score the lexical list. The dense copy's payload wins on overlap.
    for (rank, candidate) in lexical.iter().enumerate() {
        let contribution = rank_contribution(config.lexical_weight, k, rank);
        hits.entry(candidate.id.clone())
            .and_modify(|hit| {
                hit.fused_score += contribution;
                hit.lexical_rank = Some(rank);
                hit.in_both_sources = true;
            })
            .or_insert_with(|| FusedHit {
                candidate: candidate.clone(),
                fused_score: contribution,
                dense_rank: None,
                lexical_rank: Some(rank),
                in_both_sources: false,
            });
    }

    let mut results: Vec<FusedHit> = hits.into_values().collect();
    results.sort_by(FusedHit::cmp_for_ranking);

    let overlap_count = results.iter().filter(|h| h.in_both_sources).count();
    let fused_count = results.len();
    results.truncate(top_n);

    debug!(
        target: "answersmith.fuse",
        fused_count,
        overlap_count,
        output_count = results.len(),
        "rank fusion complete"
    );

    Ok(FusedResult {
        hits: results,
        params: FusionParams {
            k,
            dense_weight: config.dense_weight,
            lexical_weight: config.lexical_weight,
            top_n,
        },
    })
}
