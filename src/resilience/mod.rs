//! 弹性模块：提供熔断器、双令牌桶准入闸门，以及按名称管理它们的注册表。
//!
//! # Resilience Primitives Module
//!
//! Outbound calls to the vision model and the document library are paced and
//! isolated here.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`token_bucket`] | Lazily refilled token bucket |
//! | [`admission`] | Request + weight buckets with a bounded-concurrency gate |
//! | [`circuit_breaker`] | Three-state breaker with a doubling open window |
//! | [`registry`] | Name-keyed gates and breakers, created on first use |
//! | [`guard`] | "Gate, then breaker" in one call |
//!
//! ## Call Breaker
//!
//! - **Closed**: calls run; consecutive failures are counted
//! - **Open**: calls are rejected with [`BreakerOpen`] without running
//! - **Half-Open**: calls run again; enough successes close it, one failure reopens it
//!
//! ```rust
//! use foto_guard::resilience::{BreakerConfig, BreakerOpen, CallBreaker};
//! use std::time::Duration;
//!
//! # #[derive(Debug)] enum UploadError { Rejected(BreakerOpen) }
//! # impl From<BreakerOpen> for UploadError { fn from(e: BreakerOpen) -> Self { UploadError::Rejected(e) } }
//! # async fn demo() -> Result<(), UploadError> {
//! let breaker = CallBreaker::new(
//!     "microsoft_graph",
//!     BreakerConfig::new()
//!         .with_failure_threshold(3)
//!         .with_base_timeout(Duration::from_secs(30)),
//! );
//! let item_id = breaker.call(|| async { Ok::<_, UploadError>("item-1") }).await?;
//! # let _ = item_id;
//! # Ok(())
//! # }
//! ```
//!
//! ## Admission Gate
//!
//! ```rust
//! use foto_guard::resilience::{AdmissionGate, GateConfig};
//!
//! # async fn demo() -> foto_guard::Result<()> {
//! let gate = AdmissionGate::new("gpt-4o", GateConfig::for_resource("gpt-4o"));
//! let permit = gate.acquire(1_500).await?;
//! // call the model while holding the permit
//! drop(permit);
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod guard;
pub mod registry;
pub mod token_bucket;

pub use admission::{AdmissionGate, AdmissionPermit, BucketKind, GateConfig, GateStats};
pub use circuit_breaker::{BreakerConfig, BreakerOpen, BreakerSnapshot, BreakerState, CallBreaker};
pub use guard::Guard;
pub use registry::ResilienceRegistry;
pub use token_bucket::TokenBucket;
