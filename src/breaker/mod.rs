//! Per-upstream circuit breaker.
//!
//! Not present in this crate's original download pipeline; the state
//! machine shape (an `AtomicU8` mirror of a `Closed/Open/HalfOpen` enum,
//! guarded counters behind a mutex for the rolling window) follows the
//! circuit-breaker middleware pattern from the resilience-layer crates in
//! the wider reference set, adapted to a time-windowed failure count
//! instead of a fixed-size ring buffer.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::error::BreakerError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub rolling_window: Duration,
    pub open_duration: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

struct Window {
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
    half_open_probes_in_flight: u32,
    half_open_probes_issued: u32,
}

/// A single named circuit, one per upstream label.
pub struct CircuitBreaker {
    label: String,
    config: BreakerConfig,
    state: AtomicU8,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(label: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            label: label.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            window: Mutex::new(Window {
                failures: Vec::new(),
                opened_at: None,
                half_open_probes_in_flight: 0,
                half_open_probes_issued: 0,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition_to(&self, state: CircuitState) {
        let previous = self.state();
        self.state.store(state as u8, Ordering::Release);
        if previous != state {
            info!(label = %self.label, ?previous, ?state, "circuit breaker transitioned");
        }
    }

    /// Executes `op`, short-circuiting with [`BreakerError::Open`] when
    /// the circuit is open and no half-open probe slot is free.
    ///
    /// # Errors
    /// Returns `BreakerError::Open` without running `op`, or
    /// `BreakerError::Inner` wrapping whatever `op` returned.
    #[instrument(skip(self, op), fields(label = %self.label))]
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::open(self.label.clone()));
        }
        let result = op().await;
        self.record_outcome(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Returns `true` if a call may proceed right now, reserving a
    /// half-open probe slot as a side effect when applicable.
    fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let elapsed = window.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed < self.config.open_duration {
                    return false;
                }
                drop(window);
                self.transition_to(CircuitState::HalfOpen);
                let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                window.half_open_probes_issued = 0;
                window.half_open_probes_in_flight = 0;
                self.reserve_half_open_probe(&mut window)
            }
            CircuitState::HalfOpen => {
                let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                self.reserve_half_open_probe(&mut window)
            }
        }
    }

    fn reserve_half_open_probe(&self, window: &mut Window) -> bool {
        if window.half_open_probes_issued >= self.config.half_open_probes {
            return false;
        }
        window.half_open_probes_issued += 1;
        window.half_open_probes_in_flight += 1;
        true
    }

    fn record_outcome(&self, success: bool) {
        match self.state() {
            CircuitState::HalfOpen => {
                let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                window.half_open_probes_in_flight = window.half_open_probes_in_flight.saturating_sub(1);
                drop(window);
                if success {
                    self.close();
                } else {
                    self.open();
                }
            }
            CircuitState::Closed => {
                if success {
                    let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    window.failures.clear();
                    return;
                }
                let now = Instant::now();
                let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                window.failures.retain(|t| now.duration_since(*t) <= self.config.rolling_window);
                window.failures.push(now);
                let count = window.failures.len() as u32;
                drop(window);
                if count >= self.config.failure_threshold {
                    warn!(label = %self.label, count, "failure threshold reached, opening circuit");
                    self.open();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self) {
        let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        window.opened_at = Some(Instant::now());
        window.failures.clear();
        drop(window);
        self.transition_to(CircuitState::Open);
    }

    fn close(&self) {
        let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        window.opened_at = None;
        window.failures.clear();
        drop(window);
        self.transition_to(CircuitState::Closed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            rolling_window: Duration::from_secs(60),
            open_duration: Duration::from_millis(50),
            half_open_probes: 1,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("upstream", fast_config());
        for _ in 0..3 {
            let _: Result<(), BreakerError<&str>> =
                breaker.execute(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fails_fast_while_open() {
        let breaker = CircuitBreaker::new("upstream", fast_config());
        for _ in 0..3 {
            let _: Result<(), BreakerError<&str>> =
                breaker.execute(|| async { Err::<(), _>("boom") }).await;
        }
        let result: Result<(), BreakerError<&str>> =
            breaker.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_circuit() {
        let breaker = CircuitBreaker::new("upstream", fast_config());
        for _ in 0..3 {
            let _: Result<(), BreakerError<&str>> =
                breaker.execute(|| async { Err::<(), _>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let result: Result<(), BreakerError<&str>> = breaker.execute(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("upstream", fast_config());
        for _ in 0..3 {
            let _: Result<(), BreakerError<&str>> =
                breaker.execute(|| async { Err::<(), _>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _: Result<(), BreakerError<&str>> =
            breaker.execute(|| async { Err::<(), _>("still broken") }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
