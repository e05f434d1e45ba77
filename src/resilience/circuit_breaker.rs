//! Three-state circuit breaker: closed (normal), open (reject), half-open (probe).
//!
//! Transitions:
//! - closed -> open once the failure threshold is crossed (internal counter, or
//!   the attached monitor's error count / error rate)
//! - open -> half-open lazily, on the first state read after `reset_ms`
//! - half-open -> closed on the first success
//! - half-open -> open on any failure
//!
//! Every transition is mirrored into the attached `ResourceMonitor`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::DispatchError;
use crate::monitoring::{CircuitState, ResourceMonitor};

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Short-circuited; the operation was not invoked.
    #[error("Circuit breaker {name} is open")]
    Open { name: String },
    /// The operation ran and failed; its error is passed through untouched.
    #[error(transparent)]
    Inner(E),
}

impl From<CircuitBreakerError<DispatchError>> for DispatchError {
    fn from(err: CircuitBreakerError<DispatchError>) -> Self {
        match err {
            CircuitBreakerError::Open { name } => DispatchError::CircuitOpen { name },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_open_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub reset_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            monitor: None,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                opened_at_wall: None,
            }),
        }
    }

    /// Mirror transitions into `monitor` and, if configured, read thresholds from it.
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mirror(&self, state: CircuitState) {
        if let Some(monitor) = &self.monitor {
            monitor.track_circuit(&self.config.name, state);
        }
    }

    /// Advances open -> half-open once the reset timeout has elapsed.
    fn advance(&self, inner: &mut BreakerInner) -> bool {
        if inner.state != CircuitState::Open {
            return false;
        }
        let reset = self.config.reset_timeout();
        let elapsed = inner.opened_at.map_or(reset, |at| at.elapsed());
        if elapsed >= reset {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.failure_count = 0;
            true
        } else {
            false
        }
    }

    /// Current state, evaluating the open -> half-open timeout.
    pub fn state(&self) -> CircuitState {
        let (state, moved) = {
            let mut inner = self.lock();
            let moved = self.advance(&mut inner);
            (inner.state, moved)
        };
        if moved {
            info!(breaker = %self.config.name, "Circuit half-open; allowing probe");
            self.mirror(CircuitState::HalfOpen);
        }
        state
    }

    /// False only while open and the reset timeout has not elapsed.
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let closed = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    true
                }
                CircuitState::Closed => {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                    false
                }
                CircuitState::Open => false,
            }
        };
        if closed {
            info!(breaker = %self.config.name, "Circuit closed after successful probe");
            self.mirror(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        // Read the monitor before taking our own lock.
        let monitor_over = if self.config.use_monitor_for_threshold {
            self.monitor.as_ref().map(|m| {
                let snap = m.snapshot();
                let rate = if snap.request_count > 0 {
                    snap.error_count as f64 / snap.request_count as f64
                } else {
                    0.0
                };
                snap.error_count >= self.config.threshold as u64
                    || rate >= self.config.effective_error_rate()
            })
        } else {
            None
        };

        let opened = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => {
                    let over = match monitor_over {
                        Some(over) => over,
                        None => {
                            inner.failure_count += 1;
                            inner.failure_count >= self.config.threshold
                        }
                    };
                    if over {
                        inner.open();
                    }
                    over
                }
                CircuitState::HalfOpen => {
                    inner.open();
                    true
                }
                CircuitState::Open => false,
            }
        };
        if opened {
            warn!(
                breaker = %self.config.name,
                reset_ms = self.config.reset_ms,
                "Circuit opened"
            );
            self.mirror(CircuitState::Open);
        } else {
            debug!(breaker = %self.config.name, "Failure recorded");
        }
    }

    /// Runs `f` through the breaker, recording its verdict.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let state = self.state();
        let inner = self.lock();
        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_open_at: inner.opened_at_wall,
            threshold: self.config.threshold,
            reset_ms: self.config.reset_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitoring::{DefaultResourceMonitor, RequestMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            name: "test".into(),
            threshold,
            reset_ms,
            ..Default::default()
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, 10_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(cb.status().last_open_at.is_some());
    }

    #[test]
    fn success_decays_failure_count_while_closed() {
        let cb = breaker(2, 10_000);
        cb.record_failure();
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.status().failure_count, 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_reset_then_closes_on_success() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert!(!cb.allow_request());
        sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test]
    async fn execute_short_circuits_without_calling() {
        let cb = breaker(1, 10_000);
        let calls = AtomicUsize::new(0);

        let first: Result<(), _> = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), &str>("boom")
            })
            .await;
        assert!(matches!(first, Err(CircuitBreakerError::Inner("boom"))));

        let second = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert!(matches!(second, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transitions_are_mirrored_into_monitor() {
        let monitor = Arc::new(DefaultResourceMonitor::new(MonitorConfig::default()));
        let cb = breaker(1, 10_000).with_monitor(monitor.clone());
        cb.record_failure();
        assert_eq!(monitor.snapshot().circuit_state, Some(CircuitState::Open));
    }

    #[test]
    fn monitor_threshold_mode_uses_error_count() {
        let monitor = Arc::new(DefaultResourceMonitor::new(MonitorConfig::default()));
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            name: "monitored".into(),
            threshold: 3,
            use_monitor_for_threshold: true,
            error_rate_threshold: Some(1.1),
            ..Default::default()
        })
        .with_monitor(monitor.clone());

        for _ in 0..2 {
            monitor.track_request(RequestMeta::new("POST", "/x").status(500));
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        monitor.track_request(RequestMeta::new("POST", "/x").status(500));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn monitor_threshold_mode_uses_error_rate() {
        let monitor = Arc::new(DefaultResourceMonitor::new(MonitorConfig::default()));
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            name: "rate".into(),
            threshold: 100,
            use_monitor_for_threshold: true,
            error_rate_threshold: Some(0.5),
            ..Default::default()
        })
        .with_monitor(monitor.clone());

        monitor.track_request(RequestMeta::new("POST", "/x").status(200));
        monitor.track_request(RequestMeta::new("POST", "/x").status(502));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_error_converts_to_dispatch_error() {
        let err: DispatchError = CircuitBreakerError::<DispatchError>::Open {
            name: "cb".into(),
        }
        .into();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        let err: DispatchError =
            CircuitBreakerError::Inner(DispatchError::Throttled).into();
        assert_eq!(err.code(), "THROTTLED");
    }
}
