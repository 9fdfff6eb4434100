//! Per-agent circuit breaker.
//!
//! Three states:
//! - Closed: normal operation, the agent is routable
//! - Open: consecutive failures reached the threshold, the agent is excluded
//! - HalfOpen: the reset timeout elapsed, one trial request is allowed
//!
//! A half-open breaker admits a single trial at a time. A trial that reports
//! no outcome within the reset timeout is abandoned and another may be admitted.
//!
//! The breaker itself is not synchronized; the load balancer keeps one behind
//! a mutex per agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Requests pass through
    #[default]
    Closed,
    /// Requests are rejected until the reset timeout elapses
    Open,
    /// A trial request is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before moving from open to half-open
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Failure-isolation state for one agent.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            trial_started: None,
        }
    }

    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// State as last recorded, without applying the reset timer.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    /// Apply timer expiry. Returns the new state if it changed.
    pub fn poll(&mut self) -> Option<CircuitState> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        if elapsed >= self.config.reset_timeout {
            info!(name = %self.name, "Circuit breaker entering half-open state");
            self.state = CircuitState::HalfOpen;
            return Some(CircuitState::HalfOpen);
        }
        None
    }

    /// Whether a trial request has been admitted and not yet resolved.
    pub fn trial_in_flight(&self) -> bool {
        self.trial_started
            .is_some_and(|at| at.elapsed() < self.config.reset_timeout)
    }

    /// Admit a request. In half-open state only one trial is admitted until
    /// its outcome is recorded.
    pub fn can_execute(&mut self) -> bool {
        self.poll();
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_in_flight() {
                    return false;
                }
                debug!(name = %self.name, "Circuit breaker admitting trial request");
                self.trial_started = Some(Instant::now());
                true
            }
        }
    }

    /// Record a failed request. Returns the new state if it changed.
    pub fn record_failure(&mut self) -> Option<CircuitState> {
        self.poll();
        self.trial_started = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(Utc::now());

        match self.state {
            CircuitState::Closed => {
                debug!(
                    name = %self.name,
                    failures = self.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open();
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "Circuit breaker trial failed, reopening");
                self.open();
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Record a successful request. Returns the new state if it changed.
    pub fn record_success(&mut self) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.trial_started = None;
        if self.state == CircuitState::Closed {
            return None;
        }
        self.close();
        Some(CircuitState::Closed)
    }

    /// Force the breaker closed regardless of timer state.
    pub fn reset(&mut self) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.trial_started = None;
        if self.state == CircuitState::Closed {
            return None;
        }
        self.close();
        Some(CircuitState::Closed)
    }

    fn open(&mut self) {
        info!(
            name = %self.name,
            failures = self.consecutive_failures,
            "Circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }

    fn close(&mut self) {
        info!(name = %self.name, "Circuit breaker closed");
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }
}
