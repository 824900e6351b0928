//! Capabilities the pool needs from the handles it keeps.

use crate::Result;
use async_trait::async_trait;

/// A stateful per-key handle (e.g. one conversation's agent session).
#[async_trait]
pub trait PooledHandle: Send + Sync + 'static {
    /// Release the handle's resources. Called at most once by the pool on
    /// eviction, expiry, removal or shutdown; should tolerate repeat calls.
    async fn close(&self) -> Result<()>;
}

/// Builds a fresh handle for a key on a pool miss.
#[async_trait]
pub trait HandleFactory: Send + Sync + 'static {
    type Handle: PooledHandle;

    async fn create(&self, key: &str) -> Result<Self::Handle>;
}
