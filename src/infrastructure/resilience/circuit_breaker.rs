//! Circuit breaker guarding a broker connection.
//!
//! Closed lets every call through and counts consecutive failures. After
//! `failures_to_open` of them the breaker opens and rejects calls for
//! `open_for`. The first state read after that window moves it to half-open,
//! where calls flow again; `successes_to_close` consecutive successes close
//! it and any failure opens it again.
//!
//! One counter serves both phases: failures while closed, successes while
//! half-open. Every transition resets it.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use crate::metrics::BrokerMetrics;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failures_to_open: u32,
    pub successes_to_close: u32,
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures_to_open: 5,
            successes_to_close: 2,
            open_for: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker, for health reporting
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Consecutive failures (closed) or successes (half-open)
    pub streak: u32,
    /// Last transition, or last failure while open (ms since epoch)
    pub changed_at_ms: i64,
}

/// Lock-free breaker shared by every connection of one backend, so a dead
/// broker trips it once rather than once per worker.
pub struct CircuitBreaker {
    backend: &'static str,
    state: AtomicU8,
    streak: AtomicU32,
    changed_at_ms: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(backend: &'static str) -> Self {
        Self::with_config(backend, CircuitBreakerConfig::default())
    }

    pub fn with_config(backend: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            backend,
            state: AtomicU8::new(CircuitState::Closed as u8),
            streak: AtomicU32::new(0),
            changed_at_ms: AtomicI64::new(current_time_ms()),
            config,
        }
    }

    /// Current state; an open breaker whose window has passed becomes half-open here.
    pub fn state(&self) -> CircuitState {
        let current = self.raw_state();
        if current == CircuitState::Open && self.open_window_elapsed() {
            self.try_half_open();
        }
        self.raw_state()
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match self.raw_state() {
            CircuitState::Closed => self.streak.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.successes_to_close {
                    self.move_to(CircuitState::Closed);
                    tracing::info!(backend = self.backend, "Circuit breaker closed, broker recovered");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.raw_state() {
            CircuitState::Closed => {
                let failures = self.streak.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failures_to_open {
                    self.move_to(CircuitState::Open);
                    tracing::warn!(backend = self.backend, failures, "Circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                self.move_to(CircuitState::Open);
                tracing::warn!(backend = self.backend, "Circuit breaker reopened, trial call failed");
            }
            // Keep it open for a full window after the latest failure
            CircuitState::Open => self.changed_at_ms.store(current_time_ms(), Ordering::Release),
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            streak: self.streak.load(Ordering::Acquire),
            changed_at_ms: self.changed_at_ms.load(Ordering::Acquire),
        }
    }

    fn raw_state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn open_window_elapsed(&self) -> bool {
        let open_since = self.changed_at_ms.load(Ordering::Acquire);
        current_time_ms() - open_since >= self.config.open_for.as_millis() as i64
    }

    /// Only one caller wins the Open -> HalfOpen swap
    fn try_half_open(&self) {
        let swapped = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            self.streak.store(0, Ordering::Release);
            self.changed_at_ms.store(current_time_ms(), Ordering::Release);
            BrokerMetrics::set_circuit_state(self.backend, CircuitState::HalfOpen as i64);
            tracing::info!(backend = self.backend, "Circuit breaker half-open, allowing trial calls");
        }
    }

    fn move_to(&self, next: CircuitState) {
        self.state.store(next as u8, Ordering::Release);
        self.streak.store(0, Ordering::Release);
        self.changed_at_ms.store(current_time_ms(), Ordering::Release);
        BrokerMetrics::set_circuit_state(self.backend, next as i64);
    }
}
