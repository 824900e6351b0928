use crate::resilience::token_bucket::TokenBucket;
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Request budget per minute (request bucket capacity).
    pub requests_per_minute: u64,
    /// Weight budget per minute, e.g. estimated inference tokens.
    pub weight_units_per_minute: u64,
    /// Maximum guarded bodies running at once.
    pub max_concurrent_requests: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 500,
            weight_units_per_minute: 30_000,
            max_concurrent_requests: 10,
        }
    }
}

impl GateConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Default profile for a named upstream resource.
    ///
    /// Small ("mini") vision models get a much larger weight budget.
    pub fn for_resource(name: &str) -> Self {
        let cfg = Self::default();
        if name.to_ascii_lowercase().contains("mini") {
            cfg.with_weight_units_per_minute(200_000)
        } else {
            cfg
        }
    }

    pub fn with_requests_per_minute(mut self, rpm: u64) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_weight_units_per_minute(mut self, units: u64) -> Self {
        self.weight_units_per_minute = units;
        self
    }

    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n;
        self
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let checks = [
            ("requests_per_minute", self.requests_per_minute == 0),
            ("weight_units_per_minute", self.weight_units_per_minute == 0),
            ("max_concurrent_requests", self.max_concurrent_requests == 0),
        ];
        for (field, invalid) in checks {
            if invalid {
                return Err(Error::configuration_with_context(
                    format!("{} must be at least 1", field),
                    ErrorContext::new()
                        .with_field_path(format!("gates.{}.{}", name, field))
                        .with_source("admission_gate"),
                ));
            }
        }
        Ok(())
    }
}

/// Selects one of the two buckets behind a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Requests,
    Weight,
}

/// Read-only view of a gate's counters and current capacity.
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub name: String,
    pub requests_per_minute: u64,
    pub weight_units_per_minute: u64,
    pub max_concurrent_requests: usize,
    pub total_requests: u64,
    pub total_weight_consumed: u64,
    pub requests_throttled: u64,
    pub total_wait_ms: u64,
    pub requests_available: f64,
    pub weight_available: f64,
    pub slots_available: usize,
}

impl GateStats {
    pub fn throttle_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.requests_throttled as f64 / self.total_requests as f64
        }
    }

    pub fn avg_wait_ms(&self) -> f64 {
        if self.requests_throttled == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.requests_throttled as f64
        }
    }

    pub fn slots_in_use(&self) -> usize {
        self.max_concurrent_requests
            .saturating_sub(self.slots_available)
    }
}

#[derive(Debug)]
struct State {
    requests: TokenBucket,
    weight: TokenBucket,
    total_requests: u64,
    total_weight_consumed: u64,
    requests_throttled: u64,
    total_wait: Duration,
}

/// Concurrency slot held for the lifetime of a guarded body.
///
/// Dropping it returns the slot. Tokens drawn at admission are not returned.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    waited: Duration,
}

impl AdmissionPermit {
    /// How long the caller was held back by the token buckets.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Per-resource admission control: request-rate bucket, weight bucket, and a
/// bounded number of concurrent slots.
///
/// The wait-then-consume step runs under one async mutex, so two callers can
/// never spend the same tokens. The concurrency slot is taken afterwards,
/// outside that mutex.
pub struct AdmissionGate {
    name: String,
    cfg: GateConfig,
    state: Mutex<State>,
    slots: Arc<Semaphore>,
}

impl AdmissionGate {
    pub fn new(name: impl Into<String>, cfg: GateConfig) -> Self {
        let name = name.into();
        let state = Mutex::new(State {
            requests: TokenBucket::per_minute(cfg.requests_per_minute),
            weight: TokenBucket::per_minute(cfg.weight_units_per_minute),
            total_requests: 0,
            total_weight_consumed: 0,
            requests_throttled: 0,
            total_wait: Duration::ZERO,
        });
        let slots = Arc::new(Semaphore::new(cfg.max_concurrent_requests.max(1)));
        debug!(
            gate = %name,
            rpm = cfg.requests_per_minute,
            weight_per_minute = cfg.weight_units_per_minute,
            max_concurrent = cfg.max_concurrent_requests,
            "admission gate created"
        );
        Self {
            name,
            cfg,
            state,
            slots,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    /// Wait for rate capacity, then take a concurrency slot.
    ///
    /// Dropping the returned future before it resolves leaves bucket contents
    /// and statistics untouched.
    pub async fn acquire(&self, weight: u64) -> Result<AdmissionPermit> {
        let waited = {
            let mut st = self.state.lock().await;
            let wait = st
                .requests
                .wait_time(1.0)
                .max(st.weight.wait_time(weight as f64));

            if !wait.is_zero() {
                warn!(
                    gate = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    requests_available = st.requests.available(),
                    weight_available = st.weight.available(),
                    weight,
                    "rate limit reached, waiting"
                );
                tokio::time::sleep(wait).await;
            }

            st.requests.force_consume(1.0);
            st.weight.force_consume(weight as f64);
            st.total_requests += 1;
            st.total_weight_consumed = st.total_weight_consumed.saturating_add(weight);
            if !wait.is_zero() {
                st.requests_throttled += 1;
                st.total_wait = st.total_wait.saturating_add(wait);
            }
            wait
        };

        let slot = self.slots.clone().acquire_owned().await.map_err(|_| {
            Error::runtime_with_context(
                "admission gate semaphore closed",
                ErrorContext::new()
                    .with_details(self.name.clone())
                    .with_source("admission_gate"),
            )
        })?;

        debug!(gate = %self.name, weight, waited_ms = waited.as_millis() as u64, "admitted");
        Ok(AdmissionPermit {
            _slot: slot,
            waited,
        })
    }

    /// Run `op` inside an admission slot. The slot is released however `op` ends.
    pub async fn run<F, Fut, T, E>(&self, weight: u64, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let _permit = self.acquire(weight).await?;
        op().await
    }

    /// Draw from one bucket without waiting. Returns false (and draws nothing)
    /// if the bucket is short or `n` is negative or non-finite.
    pub async fn try_consume(&self, bucket: BucketKind, n: f64) -> bool {
        let mut st = self.state.lock().await;
        match bucket {
            BucketKind::Requests => st.requests.try_consume(n),
            BucketKind::Weight => st.weight.try_consume(n),
        }
    }

    pub async fn stats(&self) -> GateStats {
        let mut st = self.state.lock().await;
        GateStats {
            name: self.name.clone(),
            requests_per_minute: self.cfg.requests_per_minute,
            weight_units_per_minute: self.cfg.weight_units_per_minute,
            max_concurrent_requests: self.cfg.max_concurrent_requests.max(1),
            total_requests: st.total_requests,
            total_weight_consumed: st.total_weight_consumed,
            requests_throttled: st.requests_throttled,
            total_wait_ms: st.total_wait.as_millis() as u64,
            requests_available: st.requests.available(),
            weight_available: st.weight.available(),
            slots_available: self.slots.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;
    use tokio_test::assert_pending;

    fn one_per_second() -> GateConfig {
        GateConfig::new()
            .with_requests_per_minute(60)
            .with_weight_units_per_minute(6_000)
            .with_max_concurrent_requests(10)
    }

    #[test]
    fn test_gate_config_defaults() {
        let cfg = GateConfig::default();
        assert_eq!(cfg.requests_per_minute, 500);
        assert_eq!(cfg.weight_units_per_minute, 30_000);
        assert_eq!(cfg.max_concurrent_requests, 10);
    }

    #[test]
    fn test_resource_profiles() {
        assert_eq!(GateConfig::for_resource("gpt-4o"), GateConfig::default());
        let mini = GateConfig::for_resource("gpt-4o-mini");
        assert_eq!(mini.weight_units_per_minute, 200_000);
        assert_eq!(mini.requests_per_minute, 500);
        assert_eq!(mini.max_concurrent_requests, 10);
    }

    #[test]
    fn test_gate_config_validate_rejects_zero() {
        let err = GateConfig::new()
            .with_max_concurrent_requests(0)
            .validate("gpt-4o")
            .unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(
            ctx.field_path.as_deref(),
            Some("gates.gpt-4o.max_concurrent_requests")
        );
        assert!(GateConfig::new().validate("gpt-4o").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_without_wait() {
        let gate = AdmissionGate::new("test", one_per_second());
        let permit = gate.acquire(100).await.unwrap();
        assert_eq!(permit.waited(), Duration::ZERO);
        drop(permit);

        let stats = gate.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_weight_consumed, 100);
        assert_eq!(stats.requests_throttled, 0);
        assert_eq!(stats.slots_available, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_request_bucket_waits_one_second() {
        let gate = AdmissionGate::new("test", one_per_second());
        assert!(gate.try_consume(BucketKind::Requests, 60.0).await);

        let start = Instant::now();
        let permit = gate.acquire(100).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(990), "elapsed = {:?}", elapsed);
        assert_eq!(permit.waited(), Duration::from_secs(1));

        let stats = gate.stats().await;
        assert_eq!(stats.requests_throttled, 1);
        assert_eq!(stats.total_wait_ms, 1_000);
        assert_eq!(stats.avg_wait_ms(), 1_000.0);
        assert_eq!(stats.throttle_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_weight_bucket_throttles() {
        // 1000 units/min => 16.67 units/s; 100 units => 6s
        let cfg = GateConfig::new()
            .with_requests_per_minute(1_000)
            .with_weight_units_per_minute(1_000);
        let gate = AdmissionGate::new("test", cfg);
        assert!(gate.try_consume(BucketKind::Weight, 1_000.0).await);

        let start = Instant::now();
        let _permit = gate.acquire(100).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(gate.stats().await.requests_throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let cfg = GateConfig::new()
            .with_requests_per_minute(1_000)
            .with_weight_units_per_minute(100_000)
            .with_max_concurrent_requests(2);
        let gate = Arc::new(AdmissionGate::new("test", cfg));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = Arc::clone(&gate);
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(100).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let stats = gate.stats().await;
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.slots_available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_released_when_body_fails() {
        let cfg = one_per_second().with_max_concurrent_requests(1);
        let gate = AdmissionGate::new("test", cfg);

        let result: std::result::Result<(), Error> = gate
            .run(10, || async { Err(Error::runtime("upload failed")) })
            .await;
        assert!(result.is_err());
        assert_eq!(gate.stats().await.slots_available, 1);

        let value: std::result::Result<u32, Error> = gate.run(10, || async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_consumes_nothing() {
        let gate = AdmissionGate::new("test", one_per_second());
        assert!(gate.try_consume(BucketKind::Requests, 60.0).await);

        let mut pending = tokio_test::task::spawn(gate.acquire(100));
        assert_pending!(pending.poll());
        drop(pending);

        let stats = gate.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.total_weight_consumed, 0);
        assert_eq!(stats.requests_throttled, 0);
        assert_eq!(stats.total_wait_ms, 0);
        assert_eq!(stats.weight_available, 6_000.0);
        assert_eq!(stats.requests_available, 0.0);

        // The mutex was released with the dropped future.
        let permit = gate.acquire(100).await.unwrap();
        assert_eq!(permit.waited(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_not_returned_on_release() {
        let gate = AdmissionGate::new("test", one_per_second());
        for _ in 0..3 {
            let _permit = gate.acquire(1_000).await.unwrap();
        }
        let stats = gate.stats().await;
        assert_eq!(stats.requests_available, 57.0);
        assert_eq!(stats.weight_available, 3_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_draw_cannot_overfill_bucket() {
        let gate = AdmissionGate::new("test", one_per_second());
        assert!(!gate.try_consume(BucketKind::Requests, -1_000.0).await);
        assert!(!gate.try_consume(BucketKind::Weight, -1_000.0).await);

        let stats = gate.stats().await;
        assert_eq!(stats.requests_available, 60.0);
        assert_eq!(stats.weight_available, 6_000.0);
    }
}
