//! # foto-guard
//!
//! 照片分析与上传流水线的弹性与准入控制层：熔断器、双令牌桶闸门以及会话资源池。
//!
//! Resilience and admission control for the photo analysis-and-upload
//! pipeline. Every outbound call to the vision model or the document library
//! passes through this layer.
//!
//! ## Overview
//!
//! - **Call breakers** isolate a failing upstream service and back off with a
//!   doubling open window.
//! - **Admission gates** pace calls against a request-rate budget and a
//!   payload-weight budget (e.g. inference tokens), and cap concurrency.
//! - **Resource pools** keep one stateful handle per conversation, bounded by
//!   LRU eviction and idle expiry.
//!
//! The primitives are in-memory and single-process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use foto_guard::{Guard, GuardSettings, ResilienceRegistry};
//! use std::sync::Arc;
//!
//! # async fn analyze(_photo: &str) -> foto_guard::Result<String> { Ok(String::new()) }
//! #[tokio::main]
//! async fn main() -> foto_guard::Result<()> {
//!     let settings = GuardSettings::from_path("guard.yaml")?.with_env_overrides();
//!     let registry = Arc::new(ResilienceRegistry::from_settings(settings)?);
//!     let guard = Guard::new(registry);
//!
//!     let tags = guard
//!         .run("gpt-4o", "openai", 1_200, || analyze("IMG_0042.jpg"))
//!         .await?;
//!     println!("{}", tags);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Token buckets, admission gates, call breakers, registry and guard |
//! | [`pool`] | LRU/TTL pool of per-conversation handles |
//! | [`lifecycle`] | Start/stop capability and ordered lifecycle manager |
//! | [`config`] | Settings files and environment overrides |
//! | [`telemetry`] | Metrics snapshots and sinks |

pub mod config;
pub mod lifecycle;
pub mod pool;
pub mod resilience;
pub mod telemetry;

pub use config::GuardSettings;
pub use lifecycle::{Lifecycle, LifecycleManager};
pub use pool::{HandleFactory, PoolConfig, PoolStats, PooledHandle, ResourcePool};
pub use resilience::{
    AdmissionGate, AdmissionPermit, BreakerConfig, BreakerOpen, BreakerSnapshot, BreakerState,
    CallBreaker, GateConfig, GateStats, Guard, ResilienceRegistry,
};
pub use telemetry::{MetricsSink, MetricsSnapshot};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
