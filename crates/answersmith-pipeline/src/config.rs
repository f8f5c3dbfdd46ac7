//! Configuration for the pipeline coordinator.
//!
//! [`PipelineConfig`] aggregates the component configs into one serde-default
//! structure with builder helpers, environment-variable overrides, and an
//! optional TOML file loader.
//!
//! # Environment Variable Overrides
//!
//! | Variable                             | Field                        | Default |
//! |--------------------------------------|------------------------------|---------|
//! | `ANSWERSMITH_RRF_K`                  | `fusion.k`                   | `60.0`  |
//! | `ANSWERSMITH_DENSE_WEIGHT`           | `fusion.dense_weight`        | `0.5`   |
//! | `ANSWERSMITH_SIMILARITY_THRESHOLD`   | `cache.similarity_threshold` | `0.95`  |
//! | `ANSWERSMITH_CACHE_TTL_MS`           | `cache.ttl_ms`               | `3600000` |
//! | `ANSWERSMITH_ACCEPT_THRESHOLD`       | `gate.accept_threshold`      | `0.7`   |
//! | `ANSWERSMITH_RETRY_BUDGET`           | `gate.retry_budget`          | `2`     |
//! | `ANSWERSMITH_DEADLINE_MS`            | `deadline_ms`                | `30000` |
//! | `ANSWERSMITH_TOP_N`                  | `top_n`                      | `10`    |

use serde::{Deserialize, Serialize};

use answersmith_core::{PipelineError, PipelineResult};
use answersmith_fusion::{CacheConfig, FusionConfig, RetrievalConfig};
use answersmith_generate::GenerationConfig;

use crate::gate::QualityGateConfig;

/// Full configuration for one [`PipelineCoordinator`](crate::PipelineCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rank-fusion parameters.
    pub fusion: FusionConfig,
    /// Retrieval fan-out parameters.
    pub retrieval: RetrievalConfig,
    /// Result-cache parameters.
    pub cache: CacheConfig,
    /// Generation orchestrator parameters.
    pub generation: GenerationConfig,
    /// Quality-gate parameters.
    pub gate: QualityGateConfig,
    /// Overall wall-clock budget per request in milliseconds. Default: 30,000.
    pub deadline_ms: u64,
    /// Default number of fused candidates fed to reranking/generation.
    /// Default: 10.
    pub top_n: usize,
    /// Multiplier applied to `top_n` when the gate widens retrieval.
    /// Default: 2.
    pub widen_multiplier: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            generation: GenerationConfig::default(),
            gate: QualityGateConfig::default(),
            deadline_ms: 30_000,
            top_n: 10,
            widen_multiplier: 2,
        }
    }
}

impl PipelineConfig {
    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for the first invalid field.
    pub fn validate(&self) -> PipelineResult<()> {
        self.fusion.validate()?;
        self.cache.validate()?;
        if self.deadline_ms == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "deadline_ms".to_owned(),
                value: "0".to_owned(),
                reason: "the pipeline needs a positive wall-clock budget".to_owned(),
            });
        }
        if self.top_n == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "top_n".to_owned(),
                value: "0".to_owned(),
                reason: "at least one candidate must survive fusion".to_owned(),
            });
        }
        if self.widen_multiplier == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "widen_multiplier".to_owned(),
                value: "0".to_owned(),
                reason: "widening must not shrink retrieval".to_owned(),
            });
        }
        Ok(())
    }

    /// Load overrides from environment variables.
    ///
    /// Only overrides fields whose variables are set; invalid values are
    /// silently ignored (defaults are kept).
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ANSWERSMITH_RRF_K")
            && let Ok(k) = val.parse::<f64>()
            && k > 0.0
        {
            self.fusion.k = k;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_DENSE_WEIGHT")
            && let Ok(weight) = val.parse::<f64>()
            && (0.0..=1.0).contains(&weight)
        {
            self.fusion.dense_weight = weight;
            self.fusion.lexical_weight = 1.0 - weight;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_SIMILARITY_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
            && (0.0..=1.0).contains(&threshold)
        {
            self.cache.similarity_threshold = threshold;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_CACHE_TTL_MS")
            && let Ok(ttl) = val.parse::<u64>()
        {
            self.cache.ttl_ms = ttl;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_ACCEPT_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
            && (0.0..=1.0).contains(&threshold)
        {
            self.gate.accept_threshold = threshold;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_RETRY_BUDGET")
            && let Ok(budget) = val.parse::<u32>()
        {
            self.gate.retry_budget = budget;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_DEADLINE_MS")
            && let Ok(ms) = val.parse::<u64>()
            && ms > 0
        {
            self.deadline_ms = ms;
        }
        if let Ok(val) = std::env::var("ANSWERSMITH_TOP_N")
            && let Ok(n) = val.parse::<usize>()
            && n > 0
        {
            self.top_n = n;
        }
        self
    }

    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed. Flat keys match the field names of
    /// this struct.
    #[must_use]
    pub fn from_file(path: &std::path::Path) -> Self {
        std::fs::read_to_string(path).map_or_else(
            |_| Self::default(),
            |contents| match toml::from_str::<Self>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        target: "answersmith.config",
                        path = %path.display(),
                        error = %e,
                        "failed to parse config file, using defaults"
                    );
                    Self::default()
                }
            },
        )
    }
}
