//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by counting consecutive dependency failures and
//! short-circuiting calls to a fallback while the dependency cools down.
//!
//! Each dependency owns one [`Circuit`]. All transitions happen under the
//! circuit's mutex; the outbound call itself runs outside the lock.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(now >= next_retry_at)--> HALF_OPEN
//!    ^                                  ^                                 |
//!    |                                  +-------(probe failure)-----------+
//!    +-----------------------(probe success)------------------------------+
//! ```

mod registry;

pub use registry::{
    CircuitBreaker, Dependency, DependencyOptions, Execution, ExecutionSource, Fallback,
    GuardedDependency,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{SharedClock, to_chrono};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit open - requests go to the fallback
    Open,
    /// Cooldown elapsed - a single probe is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before allowing a probe
    pub reset_timeout: Duration,
    /// Upper bound on a single dependency call
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a sensitive config (opens quickly)
    pub fn sensitive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(2),
        }
    }

    /// Create a tolerant config (takes more failures to open)
    pub fn tolerant() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
        }
    }

    /// Builder: set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Builder: set reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Builder: set call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Point-in-time view of a circuit, used for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// When the next probe is allowed (set while open)
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Configured failure threshold
    pub failure_threshold: u32,
}

/// Decision taken when a call arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds
    Pass,
    /// The single half-open probe
    Probe,
    /// Short-circuit to the fallback
    Reject,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    next_retry_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Failure-tracking state machine for a single dependency
pub struct Circuit {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<CircuitInner>,
}

impl Circuit {
    /// Create a closed circuit
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                next_retry_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Dependency name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get current state, moving OPEN to HALF_OPEN once the cooldown elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_state_transition(&mut inner);
        inner.state
    }

    /// Consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Decide whether an incoming call may reach the dependency
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        self.check_state_transition(&mut inner);

        match inner.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => Admission::Reject,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Reject
                } else {
                    inner.probe_in_flight = true;
                    tracing::debug!(dependency = %self.name, "Admitting half-open probe");
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();

        match (admission, inner.state) {
            (Admission::Probe, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.next_retry_at = None;
                inner.probe_in_flight = false;
                tracing::info!(dependency = %self.name, "Circuit closed after successful probe");
            }
            (Admission::Pass, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            _ => {
                // Circuit moved on while the call was in flight
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();

        match (admission, inner.state) {
            (Admission::Probe, CircuitState::HalfOpen) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.probe_in_flight = false;
                self.open(&mut inner);
            }
            (Admission::Pass, CircuitState::Closed) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            _ => {}
        }
    }

    /// Give back a probe slot whose call never completed (e.g. cancelled)
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            tracing::debug!(dependency = %self.name, "Half-open probe abandoned");
        }
    }

    /// Manually reset the circuit to CLOSED
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_retry_at = None;
        inner.probe_in_flight = false;
        tracing::info!(dependency = %self.name, "Circuit manually reset");
    }

    /// Health view of this circuit
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.check_state_transition(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            next_retry_at: inner.next_retry_at,
            failure_threshold: self.config.failure_threshold,
        }
    }

    fn open(&self, inner: &mut CircuitInner) {
        let next_retry_at = self.clock.now() + to_chrono(self.config.reset_timeout);
        inner.state = CircuitState::Open;
        inner.next_retry_at = Some(next_retry_at);
        tracing::warn!(
            dependency = %self.name,
            failures = inner.consecutive_failures,
            next_retry_at = %next_retry_at,
            "Circuit opened"
        );
    }

    fn check_state_transition(&self, inner: &mut CircuitInner) {
        if inner.state != CircuitState::Open {
            return;
        }

        let ready = inner
            .next_retry_at
            .map(|at| self.clock.now() >= at)
            .unwrap_or(true);

        if ready {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            tracing::info!(dependency = %self.name, "Circuit half-open, awaiting probe");
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Circuit")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("config", &self.config)
            .finish()
    }
}
