use crate::config::GuardSettings;
use crate::lifecycle::Lifecycle;
use crate::resilience::admission::{AdmissionGate, GateConfig};
use crate::resilience::circuit_breaker::{BreakerConfig, CallBreaker};
use crate::telemetry::MetricsSnapshot;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Owns every named gate and breaker for the process.
///
/// Lookups create on first use from [`GuardSettings`] and hand out the same
/// `Arc` afterwards. Creation happens under the write lock, so racing first
/// lookups of one name still produce a single instance.
pub struct ResilienceRegistry {
    settings: GuardSettings,
    gates: RwLock<HashMap<String, Arc<AdmissionGate>>>,
    breakers: RwLock<HashMap<String, Arc<CallBreaker>>>,
}

impl ResilienceRegistry {
    /// Registry using built-in defaults and resource profiles.
    pub fn new() -> Self {
        Self {
            settings: GuardSettings::default(),
            gates: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: GuardSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            ..Self::new()
        })
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn gate(&self, name: &str) -> Result<Arc<AdmissionGate>> {
        if let Some(g) = self.gates.read().unwrap_or_else(|e| e.into_inner()).get(name) {
            return Ok(Arc::clone(g));
        }
        let cfg = self.settings.gate_config(name)?;
        let mut gates = self.gates.write().unwrap_or_else(|e| e.into_inner());
        let gate = gates.entry(name.to_string()).or_insert_with(|| {
            debug!(
                gate = name,
                rpm = cfg.requests_per_minute,
                wpm = cfg.weight_units_per_minute,
                max_concurrent = cfg.max_concurrent_requests,
                "creating admission gate"
            );
            Arc::new(AdmissionGate::new(name, cfg))
        });
        Ok(Arc::clone(gate))
    }

    pub fn breaker(&self, name: &str) -> Result<Arc<CallBreaker>> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(Arc::clone(b));
        }
        let cfg = self.settings.breaker_config(name)?;
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = name, threshold = cfg.failure_threshold, "creating call breaker");
            Arc::new(CallBreaker::new(name, cfg))
        });
        Ok(Arc::clone(breaker))
    }

    /// Install a gate with an explicit config. Fails if the name is already taken.
    pub fn register_gate(&self, name: &str, cfg: GateConfig) -> Result<Arc<AdmissionGate>> {
        cfg.validate(name)?;
        let mut gates = self.gates.write().unwrap_or_else(|e| e.into_inner());
        if gates.contains_key(name) {
            return Err(already_registered("gates", name));
        }
        let gate = Arc::new(AdmissionGate::new(name, cfg));
        gates.insert(name.to_string(), Arc::clone(&gate));
        Ok(gate)
    }

    /// Install a breaker with an explicit config. Fails if the name is already taken.
    pub fn register_breaker(&self, name: &str, cfg: BreakerConfig) -> Result<Arc<CallBreaker>> {
        cfg.validate(name)?;
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        if breakers.contains_key(name) {
            return Err(already_registered("breakers", name));
        }
        let breaker = Arc::new(CallBreaker::new(name, cfg));
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        Ok(breaker)
    }

    pub fn gate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .gates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn breaker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Force every breaker closed (operator action after an incident).
    pub fn reset_breakers(&self) {
        let breakers: Vec<Arc<CallBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for b in &breakers {
            b.reset();
        }
        info!(count = breakers.len(), "all call breakers reset");
    }

    /// Stats for every gate and breaker, sorted by name.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let gates: Vec<Arc<AdmissionGate>> = {
            let map = self.gates.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut gate_stats = join_all(gates.iter().map(|g| g.stats())).await;
        gate_stats.sort_by(|a, b| a.name.cmp(&b.name));

        let mut breaker_stats: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        breaker_stats.sort_by(|a, b| a.name.cmp(&b.name));

        MetricsSnapshot {
            gates: gate_stats,
            breakers: breaker_stats,
            pools: Vec::new(),
        }
    }
}

fn already_registered(kind: &str, name: &str) -> Error {
    Error::validation_with_context(
        format!("'{}' is already registered", name),
        ErrorContext::new()
            .with_field_path(format!("{}.{}", kind, name))
            .with_source("resilience_registry"),
    )
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lifecycle for ResilienceRegistry {
    fn name(&self) -> &str {
        "resilience_registry"
    }

    async fn stop(&self) -> Result<()> {
        let snap = self.snapshot().await;
        info!(
            gates = snap.gates.len(),
            breakers = snap.breakers.len(),
            tripped = ?snap.tripped_breakers(),
            "resilience registry stopped"
        );
        Ok(())
    }
}
