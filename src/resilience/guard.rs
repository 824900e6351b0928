use crate::resilience::circuit_breaker::BreakerOpen;
use crate::resilience::registry::ResilienceRegistry;
use crate::Error;
use std::future::Future;
use std::sync::Arc;

/// Runs outbound calls through admission control and then a call breaker.
///
/// The gate slot is held for the whole call. A breaker rejection still spends
/// the rate tokens drawn at admission.
#[derive(Clone)]
pub struct Guard {
    registry: Arc<ResilienceRegistry>,
}

impl Guard {
    pub fn new(registry: Arc<ResilienceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    /// Admit `weight` units against the `resource` gate, then run `op` through
    /// the `service` breaker.
    pub async fn run<F, Fut, T, E>(
        &self,
        resource: &str,
        service: &str,
        weight: u64,
        op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + From<BreakerOpen>,
    {
        let gate = self.registry.gate(resource)?;
        let breaker = self.registry.breaker(service)?;
        let _permit = gate.acquire(weight).await?;
        breaker.call(op).await
    }
}
