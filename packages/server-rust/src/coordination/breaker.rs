//! Count-based circuit breaker.
//!
//! State machine: `Closed -> Open -> HalfOpen -> Closed | Open`.
//!
//! - **Closed**: calls pass; outcomes fill a ring of the last
//!   `sliding_window_size` calls. Once `minimum_number_of_calls` outcomes are
//!   buffered and the failure rate reaches `failure_rate_threshold`, the
//!   breaker opens.
//! - **Open**: calls are rejected without running until
//!   `wait_duration_in_open` has elapsed; the next call then moves the breaker
//!   to half-open.
//! - **HalfOpen**: up to `permitted_calls_in_half_open` trial calls run. When
//!   all of them have reported, the breaker closes or reopens by the same
//!   failure-rate rule.
//!
//! Only outcomes whose error reports [`BreakerRecord::is_breaker_failure`]
//! count as failures; everything else is a success for the breaker.
//!
//! Every transition bumps a generation number. A permit only records into the
//! generation it was issued in, so late results from before a transition are
//! ignored.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls the failure rate is computed over.
    pub sliding_window_size: u32,
    /// Calls that must be buffered before the failure rate is evaluated.
    pub minimum_number_of_calls: u32,
    /// Failure rate in percent at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Cool-down before an open breaker lets trial calls through, in milliseconds.
    pub wait_duration_in_open_ms: u64,
    /// Trial calls allowed while half-open.
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 20,
            minimum_number_of_calls: 10,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_ms: 10_000,
            permitted_calls_in_half_open: 3,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn wait_duration_in_open(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_ms)
    }

    /// Rejects a failure rate threshold outside `(0, 100]`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending threshold.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            threshold_in_range(self.failure_rate_threshold),
            "failure_rate_threshold must be in (0, 100], got {}",
            self.failure_rate_threshold
        );
        Ok(())
    }
}

fn threshold_in_range(threshold: f64) -> bool {
    threshold > 0.0 && threshold <= 100.0
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

/// Errors that may count against the breaker.
pub trait BreakerRecord {
    /// Returns `true` if this error means the protected dependency is failing.
    fn is_breaker_failure(&self) -> bool;
}

/// Why the breaker handed a call to its fallback.
#[derive(Debug)]
pub enum BreakerFailure<E> {
    /// The breaker refused the call; it never ran.
    CallNotPermitted { breaker: &'static str },
    /// The call ran and failed.
    Failed(E),
}

/// Returned by [`CircuitBreaker::try_acquire`] when a call may not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker {breaker} does not permit calls ({state:?})")]
pub struct CallNotPermitted {
    pub breaker: &'static str,
    pub state: CircuitState,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    /// Failure rate in percent over the buffered calls, `None` when empty.
    pub failure_rate: Option<f64>,
    pub not_permitted_calls: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Inner {
    state: CircuitState,
    generation: u64,
    /// Closed-state ring; `true` marks a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    forced_open: bool,
    half_open_issued: u32,
    half_open_calls: u32,
    half_open_failures: u32,
    not_permitted: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            window: VecDeque::new(),
            opened_at: None,
            forced_open: false,
            half_open_issued: 0,
            half_open_calls: 0,
            half_open_failures: 0,
            not_permitted: 0,
        }
    }

    fn window_failures(&self) -> u32 {
        let failures = self.window.iter().filter(|failed| **failed).count();
        u32::try_from(failures).unwrap_or(u32::MAX)
    }
}

fn rate(failures: u32, calls: u32) -> Option<f64> {
    (calls > 0).then(|| f64::from(failures) * 100.0 / f64::from(calls))
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Process-wide circuit breaker shared by all calls through it.
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Builds a closed breaker. A threshold outside `(0, 100]` is clamped
    /// into range with a warning.
    #[must_use]
    pub fn new(name: &'static str, mut config: CircuitBreakerConfig) -> Self {
        let threshold = config.failure_rate_threshold;
        if !threshold_in_range(threshold) {
            let clamped = if threshold > 100.0 { 100.0 } else { f64::MIN_POSITIVE };
            tracing::warn!(breaker = name, threshold, clamped, "failure rate threshold out of range");
            config.failure_rate_threshold = clamped;
        }
        metrics::gauge!("joingate_breaker_state", "breaker" => name)
            .set(CircuitState::Closed.as_gauge());
        Self {
            name,
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose cool-down has elapsed still
    /// reports `Open` until the next call moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        let (buffered_calls, failed_calls) = match inner.state {
            CircuitState::HalfOpen => (inner.half_open_calls, inner.half_open_failures),
            CircuitState::Closed | CircuitState::Open => (
                u32::try_from(inner.window.len()).unwrap_or(u32::MAX),
                inner.window_failures(),
            ),
        };
        BreakerMetrics {
            state: inner.state,
            buffered_calls,
            failed_calls,
            failure_rate: rate(failed_calls, buffered_calls),
            not_permitted_calls: inner.not_permitted,
        }
    }

    /// Opens the breaker and keeps it open until [`CircuitBreaker::reset`].
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Closes the breaker and clears all recorded outcomes.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Asks permission to run one call.
    ///
    /// # Errors
    ///
    /// Returns [`CallNotPermitted`] while open (and cooling down or forced),
    /// or while half-open with all trial slots taken.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CallNotPermitted> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let cooled_down = !inner.forced_open
                && inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.wait_duration_in_open());
            if cooled_down {
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        let state = inner.state;
        let half_open = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen
                if inner.half_open_issued < self.config.permitted_calls_in_half_open.max(1) =>
            {
                inner.half_open_issued += 1;
                true
            }
            state @ (CircuitState::Open | CircuitState::HalfOpen) => {
                inner.not_permitted += 1;
                return Err(CallNotPermitted {
                    breaker: self.name,
                    state,
                });
            }
        };

        Ok(CallPermit {
            breaker: self,
            generation: inner.generation,
            half_open,
            recorded: false,
        })
    }

    /// Runs `call` if permitted and records its outcome. On rejection or
    /// failure, `fallback` receives the reason and produces the result.
    pub async fn execute<T, E, Fut, Fb, R>(&self, call: Fut, fallback: Fb) -> Result<T, R>
    where
        Fut: Future<Output = Result<T, E>>,
        E: BreakerRecord,
        Fb: FnOnce(BreakerFailure<E>) -> Result<T, R>,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                return fallback(BreakerFailure::CallNotPermitted {
                    breaker: rejected.breaker,
                });
            }
        };

        match call.await {
            Ok(value) => {
                permit.record(false);
                Ok(value)
            }
            Err(err) => {
                permit.record(err.is_breaker_failure());
                fallback(BreakerFailure::Failed(err))
            }
        }
    }

    fn record(&self, generation: u64, half_open: bool, failed: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.window.push_back(failed);
                let size = self.config.sliding_window_size.max(1) as usize;
                while inner.window.len() > size {
                    inner.window.pop_front();
                }
                let buffered = u32::try_from(inner.window.len()).unwrap_or(u32::MAX);
                let minimum = self
                    .config
                    .minimum_number_of_calls
                    .clamp(1, self.config.sliding_window_size.max(1));
                if buffered >= minimum && self.exceeds_threshold(inner.window_failures(), buffered)
                {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if half_open => {
                inner.half_open_calls += 1;
                if failed {
                    inner.half_open_failures += 1;
                }
                if inner.half_open_calls >= self.config.permitted_calls_in_half_open.max(1) {
                    let next = if self
                        .exceeds_threshold(inner.half_open_failures, inner.half_open_calls)
                    {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(&mut inner, next);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn abandon(&self, generation: u64, half_open: bool) {
        let mut inner = self.inner.lock();
        if half_open && inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.half_open_issued = inner.half_open_issued.saturating_sub(1);
        }
    }

    fn exceeds_threshold(&self, failures: u32, calls: u32) -> bool {
        rate(failures, calls).is_some_and(|r| r >= self.config.failure_rate_threshold)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.window.clear();
        inner.half_open_issued = 0;
        inner.half_open_calls = 0;
        inner.half_open_failures = 0;
        inner.opened_at = (to == CircuitState::Open).then(Instant::now);

        metrics::gauge!("joingate_breaker_state", "breaker" => self.name).set(to.as_gauge());
        match to {
            CircuitState::Open => {
                tracing::error!(breaker = self.name, ?from, forced = inner.forced_open, "circuit breaker opened");
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                tracing::info!(breaker = self.name, ?from, ?to, "circuit breaker transition");
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CallPermit
// ---------------------------------------------------------------------------

/// Permission to run one call. Record its outcome with
/// [`CallPermit::record`]; a permit dropped unrecorded frees its half-open
/// trial slot.
#[must_use = "an unrecorded permit does not count toward the breaker"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    recorded: bool,
}

impl CallPermit<'_> {
    /// Records the call outcome; `failed` counts against the breaker.
    pub fn record(mut self, failed: bool) {
        self.recorded = true;
        self.breaker.record(self.generation, self.half_open, failed);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.abandon(self.generation, self.half_open);
        }
    }
}
