//! Per-provider circuit breaker
//!
//! Protects the service from a misbehaving or down provider. Each provider
//! gets one breaker instance, constructed at startup and shared (via `Arc`)
//! between the enrichment scheduler and the request-serving path, so every
//! caller observes the same state.
//!
//! Only infrastructure failures (timeouts, connection errors, 5xx, 429)
//! may be recorded as failures. A provider that answers "nothing found"
//! is up and must be recorded as a success, otherwise the breaker trips
//! on ordinary data misses.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls allowed
    Closed,
    /// Short-circuiting, calls refused until cooldown elapses
    Open,
    /// Cooldown elapsed, exactly one probe call in flight
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Breaker tuning knobs
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker trips
    pub failure_threshold: u32,
    /// Cooldown after the first trip
    pub base_cooldown: Duration,
    /// Upper bound for the escalating cooldown
    pub max_cooldown: Duration,
    /// Cooldown growth factor on a failed probe
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    cooldown: Duration,
    trip_count: u64,
}

/// Point-in-time snapshot for diagnostics and the health endpoint
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown: Duration,
    pub trip_count: u64,
}

/// Three-state circuit breaker for one external provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                cooldown: config.base_cooldown,
                trip_count: 0,
            }),
            config,
        }
    }

    /// Provider tag this breaker guards
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether a call may proceed right now.
    ///
    /// In OPEN state, the first call after the cooldown elapses flips the
    /// breaker to HALF_OPEN and is allowed through as the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);

                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        provider = %self.provider,
                        "Circuit breaker half-open, allowing probe"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call (including data misses).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                tracing::info!(
                    provider = %self.provider,
                    "Circuit breaker closed after successful probe"
                );
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.cooldown = self.config.base_cooldown;
            }
            CircuitState::Open => {
                // Late success from a call that raced the trip; leave the
                // breaker to its cooldown.
            }
        }
    }

    /// Record an infrastructure failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure = Some(Instant::now());
                    inner.cooldown = self.config.base_cooldown;
                    inner.trip_count += 1;
                    tracing::warn!(
                        provider = %self.provider,
                        failures = inner.consecutive_failures,
                        cooldown_secs = inner.cooldown.as_secs(),
                        "Circuit breaker tripped"
                    );
                } else {
                    inner.last_failure = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                let escalated = inner.cooldown.mul_f64(self.config.cooldown_multiplier);
                inner.cooldown = escalated.min(self.config.max_cooldown);
                inner.state = CircuitState::Open;
                inner.last_failure = Some(Instant::now());
                inner.consecutive_failures += 1;
                inner.trip_count += 1;
                tracing::warn!(
                    provider = %self.provider,
                    cooldown_secs = inner.cooldown.as_secs(),
                    "Probe failed, circuit breaker re-opened with escalated cooldown"
                );
            }
            CircuitState::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Time left before an OPEN breaker will admit a probe.
    ///
    /// `None` when the breaker is not OPEN or the cooldown already elapsed.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("breaker lock poisoned");

        if inner.state != CircuitState::Open {
            return None;
        }

        let elapsed = inner.last_failure.map(|t| t.elapsed())?;
        inner.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown: inner.cooldown,
            trip_count: inner.trip_count,
        }
    }
}
