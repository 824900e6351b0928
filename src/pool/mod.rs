//! 资源池模块：按会话键缓存有状态句柄，支持 LRU 淘汰、空闲过期与后台清理。
//!
//! # Resource Pool Module
//!
//! Conversation-scoped handles (agent sessions, upload contexts) are expensive
//! to build and hold open resources. [`ResourcePool`] keeps one handle per key,
//! bounded by `max_entries` with least-recently-used eviction, and drops
//! entries that sit idle longer than `ttl`.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResourcePool`] | Keyed LRU/TTL pool with a background sweeper |
//! | [`PoolConfig`] | Capacity, idle TTL and sweep interval |
//! | [`HandleFactory`] | Builds a handle on a miss |
//! | [`PooledHandle`] | Lets the pool close what it drops |
//! | [`PoolStats`] | Created/evicted/expired counts and hit rate |
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use foto_guard::pool::{HandleFactory, PoolConfig, PooledHandle, ResourcePool};
//!
//! struct Session;
//!
//! #[async_trait]
//! impl PooledHandle for Session {
//!     async fn close(&self) -> foto_guard::Result<()> { Ok(()) }
//! }
//!
//! struct Sessions;
//!
//! #[async_trait]
//! impl HandleFactory for Sessions {
//!     type Handle = Session;
//!     async fn create(&self, _key: &str) -> foto_guard::Result<Session> { Ok(Session) }
//! }
//!
//! # async fn demo() -> foto_guard::Result<()> {
//! let pool = ResourcePool::new("sessions", PoolConfig::default(), Sessions)?;
//! pool.start();
//! let _session = pool.get_or_create("conversation-42").await?;
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod handle;
pub mod resource_pool;

pub use handle::{HandleFactory, PooledHandle};
pub use resource_pool::{EntryInfo, PoolConfig, PoolStats, ResourcePool};
