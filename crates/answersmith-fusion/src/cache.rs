//! Exact-key and similarity-keyed result cache.
//!
//! [`QueryCache`] sits in front of fusion + rerank + generation and returns
//! cached composite answers to avoid repeated work. Two lookup paths:
//!
//! 1. **Exact**: a normalized key derived from the query text plus the
//!    fusion-parameter fingerprint.
//! 2. **Similarity**: on an exact miss, the query embedding is compared
//!    against stored entries' embeddings with cosine similarity; a hit
//!    requires similarity above the configured threshold and is flagged so
//!    callers can treat it conservatively.
//!
//! Eviction is bounded-size LRU (every hit refreshes recency) plus absolute
//! TTL independent of LRU pressure. The cache is thread-safe via one
//! `std::sync::Mutex`; the lock guards only map work and is never held
//! across await points. Writes replace entries wholesale.
//!
//! An in-flight claim set gives at-most-one in-flight computation per key as
//! a soft target: a second miss for the same key can wait briefly for the
//! first computation instead of duplicating it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use answersmith_core::{PipelineError, PipelineResult, cosine_similarity};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Configuration for [`QueryCache`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled at all. Default: true.
    pub enabled: bool,
    /// Maximum number of entries (LRU beyond this). Default: 256.
    pub capacity: usize,
    /// Absolute entry lifetime in milliseconds. Default: 3,600,000 (1 hour).
    pub ttl_ms: u64,
    /// Minimum cosine similarity for the similarity path. Default: 0.95.
    pub similarity_threshold: f64,
    /// How long a second miss waits for an in-flight computation of the same
    /// key before computing itself. Default: 150 ms.
    pub inflight_wait_ms: u64,
    /// Poll interval while waiting on an in-flight key. Default: 25 ms.
    pub inflight_poll_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_ms: 3_600_000,
            similarity_threshold: 0.95,
            inflight_wait_ms: 150,
            inflight_poll_ms: 25,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a zero capacity or a
    /// similarity threshold outside [0, 1].
    pub fn validate(&self) -> PipelineResult<()> {
        if self.capacity == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "cache.capacity".to_owned(),
                value: "0".to_owned(),
                reason: "bounded cache needs at least one slot".to_owned(),
            });
        }
        if !self.similarity_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(PipelineError::InvalidConfig {
                field: "cache.similarity_threshold".to_owned(),
                value: self.similarity_threshold.to_string(),
                reason: "must be a finite value in [0.0, 1.0]".to_owned(),
            });
        }
        Ok(())
    }

    /// Entry lifetime as a [`Duration`].
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// ─── Key derivation ─────────────────────────────────────────────────────────

/// Derive the normalized exact-match key for a query and parameter
/// fingerprint: lowercased, whitespace-collapsed query text joined with the
/// fingerprint.
#[must_use]
pub fn cache_key(query: &str, params_fingerprint: &str) -> String {
    let normalized: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    format!("{}|{}", normalized.join(" "), params_fingerprint)
}

// ─── Cache ──────────────────────────────────────────────────────────────────

/// A cache hit, flagged when it came from the similarity path.
#[derive(Debug, Clone)]
pub struct CacheHit<V> {
    /// The cached value.
    pub value: V,
    /// True when matched by embedding similarity rather than exact key.
    pub from_similarity: bool,
}

/// Observable cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Exact-key hits.
    pub exact_hits: u64,
    /// Similarity-path hits.
    pub similarity_hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries evicted under LRU pressure.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

struct Entry<V> {
    value: V,
    embedding: Option<Vec<f32>>,
    created_at: Instant,
}

struct CacheState<V> {
    entries: HashMap<String, Entry<V>>,
    /// Recency order, oldest at the front. Keys are unique in this queue.
    recency: VecDeque<String>,
    inflight: HashSet<String>,
}

/// Bounded LRU + TTL cache keyed by normalized query text, with an optional
/// embedding per entry for the similarity path.
pub struct QueryCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    exact_hits: AtomicU64,
    similarity_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> std::fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> QueryCache<V> {
    /// Create a cache with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` is invalid.
    pub fn new(config: CacheConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                inflight: HashSet::new(),
            }),
            exact_hits: AtomicU64::new(0),
            similarity_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    /// Create a cache with default configuration.
    ///
    /// # Panics
    ///
    /// Never panics; the default configuration is valid.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default()).expect("default cache config is valid")
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Exact-key lookup. A hit refreshes recency; an expired entry is
    /// dropped and reported as a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheHit<V>> {
        if !self.config.enabled {
            return None;
        }
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get(key) {
            if entry.created_at.elapsed() > self.config.ttl() {
                state.entries.remove(key);
                remove_from_recency(&mut state.recency, key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let value = entry.value.clone();
            touch(&mut state.recency, key);
            self.exact_hits.fetch_add(1, Ordering::Relaxed);
            return Some(CacheHit {
                value,
                from_similarity: false,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Similarity lookup: best cosine match over stored embeddings, hit only
    /// at or above the configured threshold. Ties go to the most recent
    /// entry scanned; expired entries are skipped (and swept lazily).
    #[must_use]
    pub fn get_similar(&self, embedding: &[f32]) -> Option<CacheHit<V>> {
        if !self.config.enabled || embedding.is_empty() {
            return None;
        }
        let ttl = self.config.ttl();
        let mut state = self.lock_state();

        let mut best: Option<(String, f64)> = None;
        let mut expired: Vec<String> = Vec::new();
        for (key, entry) in &state.entries {
            if entry.created_at.elapsed() > ttl {
                expired.push(key.clone());
                continue;
            }
            let Some(ref stored) = entry.embedding else {
                continue;
            };
            let similarity = f64::from(cosine_similarity(embedding, stored));
            if similarity >= self.config.similarity_threshold
                && best.as_ref().is_none_or(|(_, s)| similarity > *s)
            {
                best = Some((key.clone(), similarity));
            }
        }

        for key in expired {
            state.entries.remove(&key);
            remove_from_recency(&mut state.recency, &key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }

        if let Some((key, similarity)) = best {
            let value = state
                .entries
                .get(&key)
                .map(|entry| entry.value.clone())
                .expect("best key present");
            touch(&mut state.recency, &key);
            self.similarity_hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "answersmith.cache",
                similarity,
                "similarity cache hit"
            );
            return Some(CacheHit {
                value,
                from_similarity: true,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace an entry wholesale, evicting the least-recently-used
    /// entry when at capacity.
    pub fn put(&self, key: impl Into<String>, embedding: Option<Vec<f32>>, value: V) {
        if !self.config.enabled {
            return;
        }
        let key = key.into();
        let mut state = self.lock_state();

        if state.entries.contains_key(&key) {
            // Wholesale replacement keeps the key's recency slot.
            touch(&mut state.recency, &key);
        } else {
            while state.entries.len() >= self.config.capacity {
                let Some(oldest) = state.recency.pop_front() else {
                    break;
                };
                if state.entries.remove(&oldest).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            state.recency.push_back(key.clone());
        }

        state.entries.insert(
            key,
            Entry {
                value,
                embedding,
                created_at: Instant::now(),
            },
        );
    }

    /// Claim a key for computation. Returns `false` when another request is
    /// already computing it.
    pub fn begin_inflight(&self, key: &str) -> bool {
        self.lock_state().inflight.insert(key.to_owned())
    }

    /// Release a previously claimed key.
    pub fn end_inflight(&self, key: &str) {
        self.lock_state().inflight.remove(key);
    }

    /// Whether a computation for `key` is currently claimed.
    #[must_use]
    pub fn is_inflight(&self, key: &str) -> bool {
        self.lock_state().inflight.contains(key)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            similarity_hits: self.similarity_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn touch(recency: &mut VecDeque<String>, key: &str) {
    remove_from_recency(recency, key);
    recency.push_back(key.to_owned());
}

fn remove_from_recency(recency: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = recency.iter().position(|k| k == key) {
        recency.remove(pos);
    }
}
