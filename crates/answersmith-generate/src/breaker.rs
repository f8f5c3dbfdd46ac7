//! Per-provider circuit breaker for the generation fallback chain.
//!
//! When a provider fails repeatedly, the breaker trips and subsequent
//! requests short-circuit to the next provider without attempting the
//! network call.
//!
//! # State Machine
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures within window)──> Open
//!   Open ──(cooldown elapsed)──> HalfOpen (exactly one probe admitted)
//!   HalfOpen ──(probe success)──> Closed (cooldown reset)
//!   HalfOpen ──(probe failure)──> Open (cooldown doubled, capped)
//! ```
//!
//! Breaker state is shared across concurrent requests: all transitions use
//! atomics, and the Open→HalfOpen transition is a compare-exchange so that
//! exactly one caller wins the probe slot while the rest keep skipping.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Configuration for a [`ProviderBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Whether the breaker is enabled. When disabled, every call is allowed.
    /// Default: true.
    pub enabled: bool,
    /// Consecutive failures required to trip. Default: 5.
    pub failure_threshold: u32,
    /// Sliding window: failures only count as consecutive while they land
    /// within this many milliseconds of the first one. Default: 60,000.
    pub window_ms: u64,
    /// Initial cooldown before a probe is admitted. Default: 30,000.
    pub cooldown_ms: u64,
    /// Upper bound for the doubling cooldown. Default: 300,000.
    pub cooldown_max_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            cooldown_max_ms: 300_000,
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Breaker state, stored as an atomic u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// What the breaker permits for the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Circuit closed: attempt normally.
    Allow,
    /// Circuit was open and the cooldown elapsed: this caller holds the
    /// single probe slot.
    Probe,
    /// Circuit open (or a probe is already in flight): skip this provider.
    Skip,
}

/// Observable breaker counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    /// Times the breaker tripped (Closed → Open).
    pub trips: u64,
    /// Times the breaker reset (HalfOpen → Closed).
    pub resets: u64,
    /// Calls short-circuited while open.
    pub calls_skipped: u64,
    /// Probe calls admitted in half-open state.
    pub probes_attempted: u64,
    /// Probe calls that succeeded.
    pub probes_succeeded: u64,
}

// ─── Breaker ────────────────────────────────────────────────────────────────

/// Lock-free circuit breaker for one provider.
pub struct ProviderBreaker {
    config: BreakerConfig,
    /// 0=Closed, 1=Open, 2=HalfOpen.
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` of the first failure in the current run.
    first_failure_ms: AtomicU64,
    /// Milliseconds since `epoch` when the circuit last tripped.
    last_trip_ms: AtomicU64,
    /// Current cooldown; doubles on failed probes up to the cap.
    current_cooldown_ms: AtomicU64,
    epoch: Instant,
    trip_count: AtomicU64,
    reset_count: AtomicU64,
    skip_count: AtomicU64,
    probe_count: AtomicU64,
    probe_success_count: AtomicU64,
}

impl ProviderBreaker {
    /// Creates a breaker with the given configuration.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown_ms;
        Self {
            config,
            state: AtomicU32::new(BreakerState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            first_failure_ms: AtomicU64::new(0),
            last_trip_ms: AtomicU64::new(0),
            current_cooldown_ms: AtomicU64::new(cooldown),
            epoch: Instant::now(),
            trip_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            skip_count: AtomicU64::new(0),
            probe_count: AtomicU64::new(0),
            probe_success_count: AtomicU64::new(0),
        }
    }

    /// Creates a breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Decide whether the current call may proceed.
    ///
    /// When the circuit is open and the cooldown has elapsed, exactly one
    /// caller is handed [`BreakerDecision::Probe`]; concurrent callers keep
    /// getting [`BreakerDecision::Skip`] until the probe resolves.
    pub fn check(&self) -> BreakerDecision {
        if !self.config.enabled {
            return BreakerDecision::Allow;
        }

        match self.current_state() {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let elapsed = self.elapsed_ms();
                let trip_time = self.last_trip_ms.load(Ordering::Acquire);
                let cooldown = self.current_cooldown_ms.load(Ordering::Acquire);
                if elapsed.saturating_sub(trip_time) >= cooldown {
                    // Single-probe admission: only the CAS winner probes.
                    if self
                        .state
                        .compare_exchange(
                            BreakerState::Open as u32,
                            BreakerState::HalfOpen as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.probe_count.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            target: "answersmith.breaker",
                            "cooldown elapsed; admitting probe call"
                        );
                        return BreakerDecision::Probe;
                    }
                }
                self.skip_count.fetch_add(1, Ordering::Relaxed);
                BreakerDecision::Skip
            }
            BreakerState::HalfOpen => {
                self.skip_count.fetch_add(1, Ordering::Relaxed);
                BreakerDecision::Skip
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        match self.current_state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            BreakerState::HalfOpen => {
                self.probe_success_count.fetch_add(1, Ordering::Relaxed);
                self.reset();
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        match self.current_state() {
            BreakerState::Closed => {
                let now = self.elapsed_ms();
                let first = self.first_failure_ms.load(Ordering::Acquire);
                let prior = self.consecutive_failures.load(Ordering::Acquire);
                let failures = if prior == 0 || now.saturating_sub(first) > self.config.window_ms {
                    // Stale run: this failure starts a new window.
                    self.first_failure_ms.store(now, Ordering::Release);
                    self.consecutive_failures.store(1, Ordering::Release);
                    1
                } else {
                    self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
                };
                if failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: back to Open with the cooldown doubled.
                let doubled = self
                    .current_cooldown_ms
                    .load(Ordering::Acquire)
                    .saturating_mul(2)
                    .min(self.config.cooldown_max_ms);
                self.current_cooldown_ms.store(doubled, Ordering::Release);
                self.last_trip_ms.store(self.elapsed_ms(), Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
                self.state
                    .store(BreakerState::Open as u32, Ordering::Release);
                tracing::warn!(
                    target: "answersmith.breaker",
                    cooldown_ms = doubled,
                    "probe failed; circuit re-opened with doubled cooldown"
                );
            }
            BreakerState::Open => {}
        }
    }

    /// Whether the circuit is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current_state() == BreakerState::Open
    }

    /// Whether the circuit is half-open (a probe is in flight).
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.current_state() == BreakerState::HalfOpen
    }

    /// Whether the circuit is closed (normal operation).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state() == BreakerState::Closed
    }

    /// The cooldown currently in force, in milliseconds.
    #[must_use]
    pub fn current_cooldown_ms(&self) -> u64 {
        self.current_cooldown_ms.load(Ordering::Acquire)
    }

    /// Snapshot of observable breaker counters.
    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            trips: self.trip_count.load(Ordering::Relaxed),
            resets: self.reset_count.load(Ordering::Relaxed),
            calls_skipped: self.skip_count.load(Ordering::Relaxed),
            probes_attempted: self.probe_count.load(Ordering::Relaxed),
            probes_succeeded: self.probe_success_count.load(Ordering::Relaxed),
        }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Manually trip the breaker (operator override or tests).
    pub fn force_open(&self) {
        self.trip();
    }

    /// Manually reset the breaker (operator override or tests).
    pub fn force_close(&self) {
        self.reset();
    }

    // ─── Internal ───────────────────────────────────────────────────

    fn current_state(&self) -> BreakerState {
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[allow(clippy::cast_possible_truncation)] // u128→u64: uptime >584M years would truncate
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn trip(&self) {
        self.state
            .store(BreakerState::Open as u32, Ordering::Release);
        self.last_trip_ms.store(self.elapsed_ms(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "answersmith.breaker",
            failures = self.config.failure_threshold,
            "circuit breaker tripped: provider disabled for cooldown"
        );
    }

    fn reset(&self) {
        self.state
            .store(BreakerState::Closed as u32, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.current_cooldown_ms
            .store(self.config.cooldown_ms, Ordering::Release);
        self.reset_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "answersmith.breaker",
            "circuit breaker reset: provider re-enabled"
        );
    }
}

impl std::fmt::Debug for ProviderBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBreaker")
            .field("state", &self.current_state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .field("cooldown_ms", &self.current_cooldown_ms())
            .field("trips", &self.trip_count.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
