use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("CLOSED"),
            BreakerState::Open => f.write_str("OPEN"),
            BreakerState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Rejection produced while a breaker is open. No operation ran, so there is no cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("call breaker '{name}' is {state}; retry in {}ms", .retry_after.as_millis())]
pub struct BreakerOpen {
    pub name: String,
    pub state: BreakerState,
    pub retry_after: Duration,
}

/// Point-in-time view of a breaker.
///
/// Every admitted or rejected call settles exactly once, so
/// `total_requests == total_successes + total_failures` once no call is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub base_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub current_timeout_ms: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl BreakerSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_successes as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Successes needed in half-open before closing. `None` means `failure_threshold`.
    pub success_threshold: Option<u32>,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: None,
            base_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
        }
    }
}

impl BreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the number of half-open successes required to close
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Set the initial open duration
    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.base_timeout = timeout;
        self
    }

    /// Set the upper bound for the doubling open duration
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    pub fn effective_success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(self.failure_threshold)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let fail = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(format!("breakers.{}.{}", name, field))
                    .with_source("call_breaker"),
            ))
        };
        if self.failure_threshold == 0 {
            return fail("failure_threshold", "failure_threshold must be at least 1");
        }
        if self.effective_success_threshold() == 0 {
            return fail("success_threshold", "success_threshold must be at least 1");
        }
        if self.base_timeout.is_zero() {
            return fail("base_timeout_secs", "base timeout must be positive");
        }
        if self.max_timeout < self.base_timeout {
            return fail(
                "max_timeout_secs",
                "max timeout must not be shorter than base timeout",
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
struct State {
    state: BreakerState,
    current_timeout: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
}

/// Three-state circuit breaker wrapping arbitrary async operations.
///
/// - Closed: calls pass; `failure_threshold` consecutive failures open it
/// - Open: calls are rejected without running until `current_timeout` elapses
/// - Half-open: calls run; `success_threshold` successes close it, one failure reopens it
///
/// Every (re)open doubles `current_timeout`, capped at `max_timeout`. Closing
/// or [`CallBreaker::reset`] restores `base_timeout`.
///
/// The lock is never held across the wrapped operation.
#[derive(Debug)]
pub struct CallBreaker {
    name: String,
    cfg: BreakerConfig,
    state: Mutex<State>,
}

impl CallBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        let current_timeout = cfg.base_timeout;
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                current_timeout,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.cfg
    }

    // A poisoned lock only means a panic happened elsewhere mid-update; the
    // counters are still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` through the breaker.
    ///
    /// Errors from `op` come back unchanged. While open, `op` is not invoked
    /// and the rejection is converted into the caller's error type.
    /// If the returned future is dropped while `op` is running, the call is
    /// counted as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<BreakerOpen>,
    {
        self.admit()?;
        let mut pending = PendingCall {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        pending.settled = true;
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    fn admit(&self) -> std::result::Result<(), BreakerOpen> {
        let mut st = self.lock();
        st.total_requests += 1;
        if st.state != BreakerState::Open {
            return Ok(());
        }

        let now = Instant::now();
        let opened_at = st.opened_at.unwrap_or(now);
        let elapsed = now.saturating_duration_since(opened_at);
        if elapsed < st.current_timeout {
            st.total_failures += 1;
            return Err(BreakerOpen {
                name: self.name.clone(),
                state: st.state,
                retry_after: st.current_timeout - elapsed,
            });
        }

        st.state = BreakerState::HalfOpen;
        st.consecutive_successes = 0;
        info!(breaker = %self.name, "call breaker half-open, probing");
        Ok(())
    }

    fn on_success(&self) {
        let mut st = self.lock();
        st.total_successes += 1;
        match st.state {
            BreakerState::Closed => st.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.cfg.effective_success_threshold() {
                    self.close_locked(&mut st);
                    info!(breaker = %self.name, "call breaker closed");
                }
            }
            // A call admitted before the breaker opened finished late.
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut st = self.lock();
        st.total_failures += 1;
        match st.state {
            BreakerState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures >= self.cfg.failure_threshold {
                    self.open_locked(&mut st);
                }
            }
            BreakerState::HalfOpen => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                self.open_locked(&mut st);
            }
            BreakerState::Open => {}
        }
    }

    fn open_locked(&self, st: &mut State) {
        st.state = BreakerState::Open;
        st.opened_at = Some(Instant::now());
        st.consecutive_successes = 0;
        st.current_timeout = st
            .current_timeout
            .saturating_mul(2)
            .min(self.cfg.max_timeout);
        warn!(
            breaker = %self.name,
            consecutive_failures = st.consecutive_failures,
            timeout_ms = st.current_timeout.as_millis() as u64,
            "call breaker opened"
        );
    }

    fn close_locked(&self, st: &mut State) {
        st.state = BreakerState::Closed;
        st.opened_at = None;
        st.consecutive_failures = 0;
        st.consecutive_successes = 0;
        st.current_timeout = self.cfg.base_timeout;
    }

    /// Force the breaker closed and forget failure history. Totals are kept.
    pub fn reset(&self) {
        let mut st = self.lock();
        self.close_locked(&mut st);
        info!(breaker = %self.name, "call breaker reset");
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn current_timeout(&self) -> Duration {
        self.lock().current_timeout
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let st = self.lock();
        let open_remaining_ms = match (st.state, st.opened_at) {
            (BreakerState::Open, Some(at)) => {
                let elapsed = Instant::now().saturating_duration_since(at);
                st.current_timeout
                    .checked_sub(elapsed)
                    .filter(|d| !d.is_zero())
                    .map(|d| d.as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            success_threshold: self.cfg.effective_success_threshold(),
            base_timeout_ms: self.cfg.base_timeout.as_millis() as u64,
            max_timeout_ms: self.cfg.max_timeout.as_millis() as u64,
            current_timeout_ms: st.current_timeout.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            open_remaining_ms,
            total_requests: st.total_requests,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
        }
    }
}

/// Records a failure if an admitted call is dropped before it settles.
struct PendingCall<'a> {
    breaker: &'a CallBreaker,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(breaker = %self.breaker.name, "call dropped before completion");
            self.breaker.on_failure();
        }
    }
}
