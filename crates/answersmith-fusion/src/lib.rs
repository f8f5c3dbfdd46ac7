//! Rank fusion, hybrid retrieval fan-out, and result caching for answersmith.
//!
//! This crate provides:
//! - **RRF**: weighted Reciprocal Rank Fusion (K=60) with 4-level
//!   deterministic tie-breaking and source-weight validation.
//! - **[`HybridRetriever`]**: parallel dense + lexical retrieval joined
//!   before fusion, degrading gracefully to a single source.
//! - **[`QueryCache`]**: exact-key + cosine-similarity result cache with
//!   bounded LRU, absolute TTL, and soft at-most-one in-flight computation
//!   per key.

pub mod cache;
pub mod retrieve;
pub mod rrf;

pub use cache::{CacheConfig, CacheHit, CacheMetrics, QueryCache, cache_key};
pub use retrieve::{HybridRetriever, RetrievalConfig, RetrievalOutcome};
pub use rrf::{FusionConfig, candidate_count, fuse};
