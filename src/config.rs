//! 配置模块：从 YAML/JSON 文件与环境变量加载熔断器、准入闸门和会话池设置。
//!
//! Guard settings.
//!
//! Every field is optional and overlays the built-in defaults, so a settings
//! file only names what it changes:
//!
//! ```yaml
//! breaker_defaults:
//!   failure_threshold: 5
//! breakers:
//!   openai:
//!     base_timeout_secs: 30
//!   microsoft_graph:
//!     failure_threshold: 3
//! gates:
//!   gpt-4o:
//!     weight_units_per_minute: 60000
//! pool:
//!   max_entries: 200
//! ```
//!
//! Resolution order for a named gate: resource profile
//! ([`GateConfig::for_resource`]), then `gate_defaults`, then `gates.<name>`.
//! Breakers and the pool resolve the same way from their plain defaults.

use crate::pool::PoolConfig;
use crate::resilience::admission::GateConfig;
use crate::resilience::circuit_breaker::BreakerConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_BREAKER_FAILURE_THRESHOLD: &str = "FOTO_GUARD_BREAKER_FAILURE_THRESHOLD";
pub const ENV_BREAKER_SUCCESS_THRESHOLD: &str = "FOTO_GUARD_BREAKER_SUCCESS_THRESHOLD";
pub const ENV_BREAKER_BASE_TIMEOUT_SECS: &str = "FOTO_GUARD_BREAKER_BASE_TIMEOUT_SECS";
pub const ENV_BREAKER_MAX_TIMEOUT_SECS: &str = "FOTO_GUARD_BREAKER_MAX_TIMEOUT_SECS";
pub const ENV_RPM: &str = "FOTO_GUARD_RPM";
pub const ENV_WEIGHT_PER_MINUTE: &str = "FOTO_GUARD_WEIGHT_PER_MINUTE";
pub const ENV_MAX_CONCURRENT: &str = "FOTO_GUARD_MAX_CONCURRENT";
pub const ENV_POOL_MAX_ENTRIES: &str = "FOTO_GUARD_POOL_MAX_ENTRIES";
pub const ENV_POOL_TTL_SECS: &str = "FOTO_GUARD_POOL_TTL_SECS";
pub const ENV_POOL_CLEANUP_SECS: &str = "FOTO_GUARD_POOL_CLEANUP_SECS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_timeout_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timeout_secs: Option<f64>,
}

impl BreakerSettings {
    fn merged(&self, over: &BreakerSettings) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: over.failure_threshold.or(self.failure_threshold),
            success_threshold: over.success_threshold.or(self.success_threshold),
            base_timeout_secs: over.base_timeout_secs.or(self.base_timeout_secs),
            max_timeout_secs: over.max_timeout_secs.or(self.max_timeout_secs),
        }
    }

    fn apply(&self, name: &str, mut cfg: BreakerConfig) -> Result<BreakerConfig> {
        let path = |field: &str| format!("breakers.{}.{}", name, field);
        if let Some(n) = self.failure_threshold {
            cfg.failure_threshold = n;
        }
        if let Some(n) = self.success_threshold {
            cfg.success_threshold = Some(n);
        }
        if let Some(s) = self.base_timeout_secs {
            cfg.base_timeout = secs(s, path("base_timeout_secs"))?;
        }
        if let Some(s) = self.max_timeout_secs {
            cfg.max_timeout = secs(s, path("max_timeout_secs"))?;
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_units_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<usize>,
}

impl GateSettings {
    fn apply(&self, mut cfg: GateConfig) -> GateConfig {
        if let Some(n) = self.requests_per_minute {
            cfg.requests_per_minute = n;
        }
        if let Some(n) = self.weight_units_per_minute {
            cfg.weight_units_per_minute = n;
        }
        if let Some(n) = self.max_concurrent_requests {
            cfg.max_concurrent_requests = n;
        }
        cfg
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_interval_secs: Option<f64>,
}

/// Settings for every guard primitive, as loaded from a file and/or environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardSettings {
    pub breaker_defaults: BreakerSettings,
    pub breakers: BTreeMap<String, BreakerSettings>,
    pub gate_defaults: GateSettings,
    pub gates: BTreeMap<String, GateSettings>,
    pub pool: PoolSettings,
}

fn secs(value: f64, field_path: String) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::configuration_with_context(
            "duration must be a finite, non-negative number of seconds",
            ErrorContext::new()
                .with_field_path(field_path)
                .with_details(format!("got {}", value))
                .with_source("guard_settings"),
        ));
    }
    Duration::try_from_secs_f64(value).map_err(|e| {
        Error::configuration_with_context(
            format!("duration out of range: {}", e),
            ErrorContext::new()
                .with_field_path(field_path)
                .with_source("guard_settings"),
        )
    })
}

impl GuardSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let settings = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn breaker_config(&self, name: &str) -> Result<BreakerConfig> {
        let layered = match self.breakers.get(name) {
            Some(own) => self.breaker_defaults.merged(own),
            None => self.breaker_defaults.clone(),
        };
        let cfg = layered.apply(name, BreakerConfig::default())?;
        cfg.validate(name)?;
        Ok(cfg)
    }

    pub fn gate_config(&self, name: &str) -> Result<GateConfig> {
        let mut cfg = self.gate_defaults.apply(GateConfig::for_resource(name));
        if let Some(own) = self.gates.get(name) {
            cfg = own.apply(cfg);
        }
        cfg.validate(name)?;
        Ok(cfg)
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        let mut cfg = PoolConfig::default();
        if let Some(n) = self.pool.max_entries {
            cfg.max_entries = n;
        }
        if let Some(s) = self.pool.ttl_secs {
            cfg.ttl = secs(s, "pool.ttl_secs".to_string())?;
        }
        if let Some(s) = self.pool.cleanup_interval_secs {
            cfg.cleanup_interval = secs(s, "pool.cleanup_interval_secs".to_string())?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve every configured entry and report the first invalid one.
    pub fn validate(&self) -> Result<()> {
        self.breaker_config("default")?;
        for name in self.breakers.keys() {
            self.breaker_config(name)?;
        }
        self.gate_config("default")?;
        for name in self.gates.keys() {
            self.gate_config(name)?;
        }
        self.pool_config()?;
        Ok(())
    }

    /// Apply `FOTO_GUARD_*` environment variables to the defaults sections.
    ///
    /// - `FOTO_GUARD_BREAKER_FAILURE_THRESHOLD`, `FOTO_GUARD_BREAKER_SUCCESS_THRESHOLD`
    /// - `FOTO_GUARD_BREAKER_BASE_TIMEOUT_SECS`, `FOTO_GUARD_BREAKER_MAX_TIMEOUT_SECS`
    /// - `FOTO_GUARD_RPM`, `FOTO_GUARD_WEIGHT_PER_MINUTE`, `FOTO_GUARD_MAX_CONCURRENT`
    /// - `FOTO_GUARD_POOL_MAX_ENTRIES`, `FOTO_GUARD_POOL_TTL_SECS`, `FOTO_GUARD_POOL_CLEANUP_SECS`
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`GuardSettings::with_env_overrides`] with a custom variable lookup.
    pub fn with_overrides_from<L>(mut self, lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let b = &mut self.breaker_defaults;
        override_field(&lookup, ENV_BREAKER_FAILURE_THRESHOLD, &mut b.failure_threshold);
        override_field(&lookup, ENV_BREAKER_SUCCESS_THRESHOLD, &mut b.success_threshold);
        override_field(&lookup, ENV_BREAKER_BASE_TIMEOUT_SECS, &mut b.base_timeout_secs);
        override_field(&lookup, ENV_BREAKER_MAX_TIMEOUT_SECS, &mut b.max_timeout_secs);

        let g = &mut self.gate_defaults;
        override_field(&lookup, ENV_RPM, &mut g.requests_per_minute);
        override_field(&lookup, ENV_WEIGHT_PER_MINUTE, &mut g.weight_units_per_minute);
        override_field(&lookup, ENV_MAX_CONCURRENT, &mut g.max_concurrent_requests);

        let p = &mut self.pool;
        override_field(&lookup, ENV_POOL_MAX_ENTRIES, &mut p.max_entries);
        override_field(&lookup, ENV_POOL_TTL_SECS, &mut p.ttl_secs);
        override_field(&lookup, ENV_POOL_CLEANUP_SECS, &mut p.cleanup_interval_secs);
        self
    }
}

fn override_field<L, T>(lookup: &L, key: &str, slot: &mut Option<T>)
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = Some(v),
            Err(_) => warn!(var = key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
breaker_defaults:
  failure_threshold: 4
breakers:
  openai:
    base_timeout_secs: 30
    max_timeout_secs: 120
  microsoft_graph:
    failure_threshold: 3
    success_threshold: 1
gate_defaults:
  max_concurrent_requests: 4
gates:
  gpt-4o:
    weight_units_per_minute: 60000
pool:
  max_entries: 200
  ttl_secs: 1800
"#;

    #[test]
    fn test_empty_settings_resolve_to_defaults() {
        let s = GuardSettings::new();
        assert_eq!(s.breaker_config("openai").unwrap(), BreakerConfig::default());
        assert_eq!(s.gate_config("gpt-4o").unwrap(), GateConfig::default());
        assert_eq!(s.pool_config().unwrap(), PoolConfig::default());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_yaml_layering() {
        let s = GuardSettings::from_yaml_str(SAMPLE).unwrap();

        let openai = s.breaker_config("openai").unwrap();
        assert_eq!(openai.failure_threshold, 4);
        assert_eq!(openai.base_timeout, Duration::from_secs(30));
        assert_eq!(openai.max_timeout, Duration::from_secs(120));

        let graph = s.breaker_config("microsoft_graph").unwrap();
        assert_eq!(graph.failure_threshold, 3);
        assert_eq!(graph.effective_success_threshold(), 1);
        assert_eq!(graph.base_timeout, Duration::from_secs(60));

        let gpt = s.gate_config("gpt-4o").unwrap();
        assert_eq!(gpt.weight_units_per_minute, 60_000);
        assert_eq!(gpt.max_concurrent_requests, 4);

        // Profile survives when only defaults are overridden
        let mini = s.gate_config("gpt-4o-mini").unwrap();
        assert_eq!(mini.weight_units_per_minute, 200_000);
        assert_eq!(mini.max_concurrent_requests, 4);

        let pool = s.pool_config().unwrap();
        assert_eq!(pool.max_entries, 200);
        assert_eq!(pool.ttl, Duration::from_secs(1800));
        assert_eq!(pool.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_json_settings() {
        let s = GuardSettings::from_json_str(
            r#"{"gates": {"claude": {"requests_per_minute": 50}}, "pool": {"cleanup_interval_secs": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(s.gate_config("claude").unwrap().requests_per_minute, 50);
        assert_eq!(
            s.pool_config().unwrap().cleanup_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = GuardSettings::from_yaml_str("pool:\n  max_sessions: 3\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_invalid_values_name_the_field() {
        let s = GuardSettings::from_yaml_str("breakers:\n  openai:\n    base_timeout_secs: -1\n")
            .unwrap();
        let err = s.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("breakers.openai.base_timeout_secs")
        );

        let s = GuardSettings::from_yaml_str("gates:\n  gpt-4o:\n    requests_per_minute: 0\n")
            .unwrap();
        let err = s.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("gates.gpt-4o.requests_per_minute")
        );

        let s = GuardSettings::from_yaml_str(
            "breakers:\n  openai:\n    base_timeout_secs: 100\n    max_timeout_secs: 10\n",
        )
        .unwrap();
        assert!(s.breaker_config("openai").is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_BREAKER_FAILURE_THRESHOLD, "7"),
            (ENV_BREAKER_BASE_TIMEOUT_SECS, "15"),
            (ENV_RPM, "120"),
            (ENV_MAX_CONCURRENT, "not-a-number"),
            (ENV_POOL_TTL_SECS, "90"),
        ]
        .into_iter()
        .collect();
        let s = GuardSettings::new()
            .with_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        let b = s.breaker_config("openai").unwrap();
        assert_eq!(b.failure_threshold, 7);
        assert_eq!(b.base_timeout, Duration::from_secs(15));

        let g = s.gate_config("gpt-4o").unwrap();
        assert_eq!(g.requests_per_minute, 120);
        assert_eq!(g.max_concurrent_requests, 10);

        assert_eq!(s.pool_config().unwrap().ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_from_path_and_yaml_export() {
        let dir = std::env::temp_dir().join(format!("foto-guard-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let yaml_path = dir.join("guard.yaml");
        std::fs::write(&yaml_path, SAMPLE).unwrap();
        let loaded = GuardSettings::from_path(&yaml_path).unwrap();
        assert_eq!(loaded, GuardSettings::from_yaml_str(SAMPLE).unwrap());

        let round = GuardSettings::from_yaml_str(&loaded.to_yaml_string().unwrap()).unwrap();
        assert_eq!(round, loaded);

        let json_path = dir.join("guard.json");
        std::fs::write(&json_path, r#"{"pool": {"max_entries": 0}}"#).unwrap();
        assert!(GuardSettings::from_path(&json_path).is_err());

        assert!(matches!(
            GuardSettings::from_path(dir.join("missing.yaml")),
            Err(Error::Io(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
