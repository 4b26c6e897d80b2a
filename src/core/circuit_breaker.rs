//! Per-route three-state circuit breaker.
//!
//! Closed counts consecutive failures and opens at the configured threshold. Open
//! rejects everything until the recovery timeout has elapsed, at which point the next
//! `is_open` check moves the breaker to HalfOpen and lets traffic probe the upstream.
//! A success in HalfOpen closes the circuit; a failure re-opens it immediately.
//!
//! All transitions happen under one mutex so that concurrent reports near the threshold
//! are linearizable. Time is read from `tokio::time::Instant` so that tests can drive
//! recovery with a paused clock.
use std::{fmt, sync::Mutex, time::Duration};

use tokio::time::Instant;
use tracing::{info, warn};

pub use crate::config::models::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    /// Value exported on the `gateway_circuit_breaker_state` gauge.
    pub fn as_gauge(self) -> u8 {
        self as u8
    }

    pub fn from_gauge(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Closed),
            1 => Some(Self::Open),
            2 => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum CircuitBreaker {
    /// Never rejects; every operation is a no-op.
    Disabled,
    Enabled(EnabledBreaker),
}

#[derive(Debug)]
pub struct EnabledBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_requests: u32,
    state: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl EnabledBreaker {
    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // A poisoned breaker still holds a coherent state machine; keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        if !config.enabled {
            return Self::Disabled;
        }
        Self::Enabled(EnabledBreaker {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(config.recovery_timeout),
            half_open_requests: config.half_open_requests.max(1),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
            }),
        })
    }

    /// Build from an optional route setting; absent configuration disables the breaker.
    pub fn from_config(config: Option<&CircuitBreakerConfig>) -> Self {
        config.map_or(Self::Disabled, Self::new)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Whether requests must be rejected right now.
    ///
    /// Once the recovery timeout has elapsed this check itself moves Open to HalfOpen
    /// and answers `false`; only one caller performs that transition.
    pub fn is_open(&self) -> bool {
        let Self::Enabled(inner) = self else {
            return false;
        };
        let mut guard = inner.lock();
        match guard.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = guard
                    .opened_at
                    .map(|at| at.elapsed() >= inner.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    guard.state = CircuitState::HalfOpen;
                    info!(
                        "Circuit breaker half-open after {:?}, admitting up to {} probe request(s)",
                        inner.recovery_timeout, inner.half_open_requests
                    );
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        match self {
            Self::Disabled => CircuitState::Closed,
            Self::Enabled(inner) => inner.lock().state,
        }
    }

    pub fn record_success(&self) {
        let Self::Enabled(inner) = self else {
            return;
        };
        let mut guard = inner.lock();
        match guard.state {
            CircuitState::Closed => guard.failures = 0,
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Closed;
                guard.failures = 0;
                guard.opened_at = None;
                info!("Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let Self::Enabled(inner) = self else {
            return;
        };
        let mut guard = inner.lock();
        let now = Instant::now();
        guard.last_failure = Some(now);
        match guard.state {
            CircuitState::Closed => {
                guard.failures = guard.failures.saturating_add(1);
                if guard.failures >= inner.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(now);
                    warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        guard.failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                warn!("Circuit breaker re-opened: probe request failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Consecutive failures observed while closed.
    pub fn failures(&self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Enabled(inner) => inner.lock().failures,
        }
    }

    pub fn last_failure(&self) -> Option<Instant> {
        match self {
            Self::Disabled => None,
            Self::Enabled(inner) => inner.lock().last_failure,
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        if let Self::Enabled(inner) = self {
            let mut guard = inner.lock();
            guard.state = CircuitState::Closed;
            guard.failures = 0;
            guard.last_failure = None;
            guard.opened_at = None;
        }
    }
}
