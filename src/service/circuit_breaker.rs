use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Rejection issued while the breaker is open. Callers must treat this as
/// transient and distinct from upstream failures (no retry-count increment).
#[derive(Debug, Error)]
#[error("circuit breaker open for {target}")]
pub struct CircuitOpenError {
    pub target: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl BreakerConfig {
    pub fn oracle_defaults() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn store_defaults() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Per-target stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub target: &'static str,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_failure_secs_ago: Option<u64>,
}

/// Three-state circuit breaker. Callers bracket the protected call with
/// `try_acquire` and `record_success` / `record_failure`.
pub struct CircuitBreaker {
    target: &'static str,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: &'static str, config: BreakerConfig) -> Self {
        Self {
            target,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_successes: 0,
                total_failures: 0,
                last_failure_at: None,
                opened_at: None,
            }),
        }
    }

    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout {
                    info!(target = self.target, "Circuit breaker half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: self.target,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!(target = self.target, "Circuit breaker closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.consecutive_successes = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        target = self.target,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(target = self.target, "Circuit breaker reopened from half-open");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            target: self.target,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            last_failure_secs_ago: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        info!(target = self.target, "Circuit breaker manually reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[test]
    fn opens_at_failure_threshold() {
        let cb = breaker(30_000);
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.stats().state, BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_streak_while_closed() {
        let cb = breaker(30_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.stats().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_successes() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.stats().state, BreakerState::Open);

        // Zero timeout: the next acquire probes half-open immediately.
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.stats().state, BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.stats().state, BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.stats().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.stats().state, BreakerState::Open);
    }

    #[test]
    fn manual_reset_closes() {
        let cb = breaker(30_000);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.try_acquire().is_err());
        cb.reset();
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn stats_track_totals() {
        let cb = breaker(30_000);
        cb.record_success();
        cb.record_failure();
        cb.record_success();
        let stats = cb.stats();
        assert_eq!(stats.total_successes, 2);
        assert_eq!(stats.total_failures, 1);
        assert!(stats.last_failure_secs_ago.is_some());
    }
}
