//! Circuit breaker for endpoint protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: endpoint assumed down, calls fail fast
//! - Half-Open: a limited trial tests whether the endpoint recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within monitoring window
//! Open → Half-Open: reset_timeout elapsed since the last failure
//! Half-Open → Closed: trial successes >= half_open_max_calls (failure history cleared)
//! Half-Open → Open: any failure during the trial
//! ```
//!
//! # Design Decisions
//! - Per-endpoint circuit breaker (not global)
//! - Fail fast in Open state (the call is never started)
//! - The failure window is pruned lazily on every access

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, EndpointOverride};
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Error returned by a call wrapped in a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError<E> {
    /// The call was deliberately not attempted.
    #[error("circuit breaker is open for {endpoint}; service unavailable")]
    CircuitOpen { endpoint: String },

    /// The call was attempted and failed.
    #[error("{0}")]
    Transport(E),

    /// The call was dropped before it settled, e.g. at runtime shutdown.
    #[error("request was cancelled before completing")]
    Cancelled,
}

impl<E> CallError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen { .. })
    }

    /// The underlying transport error, if the call was attempted.
    pub fn into_transport(self) -> Option<E> {
        match self {
            CallError::Transport(e) => Some(e),
            CallError::CircuitOpen { .. } | CallError::Cancelled => None,
        }
    }
}

/// Tuning for a single breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
    pub monitoring_window: Duration,
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            monitoring_window: Duration::from_millis(60_000),
            half_open_max_calls: 3,
        }
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerOptions {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            monitoring_window: Duration::from_millis(config.monitoring_window_ms),
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

impl CircuitBreakerOptions {
    /// Apply the fields an endpoint override sets.
    pub fn with_override(mut self, o: &EndpointOverride) -> Self {
        if let Some(v) = o.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = o.reset_timeout_ms {
            self.reset_timeout = Duration::from_millis(v);
        }
        if let Some(v) = o.monitoring_window_ms {
            self.monitoring_window = Duration::from_millis(v);
        }
        if let Some(v) = o.half_open_max_calls {
            self.half_open_max_calls = v;
        }
        self
    }
}

/// A failure retained inside the monitoring window.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub timestamp: Instant,
    pub error: String,
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: usize,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<FailureRecord>,
    trial_successes: usize,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn prune(&mut self, window: Duration, now: Instant) {
        // Records are appended in time order.
        while self
            .failures
            .front()
            .is_some_and(|f| now.saturating_duration_since(f.timestamp) >= window)
        {
            self.failures.pop_front();
        }
    }
}

/// Per-endpoint failure counter and state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `endpoint`.
    pub fn new(endpoint: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        let endpoint = endpoint.into();
        metrics::record_circuit_state(&endpoint, CircuitState::Closed);
        Self {
            endpoint,
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                trial_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        metrics::record_circuit_state(&self.endpoint, to);
        match to {
            CircuitState::Open => tracing::warn!(
                endpoint = %self.endpoint,
                from = %from,
                failures = inner.failures.len(),
                threshold = self.options.failure_threshold,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = %self.endpoint, "Circuit half-open, allowing trial calls")
            }
            CircuitState::Closed => {
                tracing::info!(endpoint = %self.endpoint, from = %from, "Circuit closed, service recovered")
            }
        }
    }

    /// Current state, without applying any time-based transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Check whether a call may start. May move Open → Half-Open.
    pub fn can_execute(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(self.options.monitoring_window, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.options.reset_timeout {
                    inner.trial_successes = 0;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => inner.trial_successes < self.options.half_open_max_calls,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(self.options.monitoring_window, now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.options.half_open_max_calls {
                    inner.failures.clear();
                    inner.trial_successes = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.failures.clear(),
            // A call admitted before the circuit opened; nothing to learn from it.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, error: impl fmt::Display) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(self.options.monitoring_window, now);

        inner.failures.push_back(FailureRecord {
            timestamp: now,
            error: error.to_string(),
        });
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_successes = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                if inner.failures.len() >= self.options.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                } else {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        failures = inner.failures.len(),
                        error = %error,
                        "Failure recorded"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Failures retained in the current window.
    pub fn failure_count(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(self.options.monitoring_window, now);
        inner.failures.len()
    }

    /// Failures retained in the current window, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(self.options.monitoring_window, now);
        inner.failures.iter().cloned().collect()
    }

    /// Force the breaker closed and forget all history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.trial_successes = 0;
        inner.last_failure = None;
        inner.state = CircuitState::Closed;
        metrics::record_circuit_state(&self.endpoint, CircuitState::Closed);
        tracing::info!(endpoint = %self.endpoint, "Circuit reset manually");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
        }
    }
}
