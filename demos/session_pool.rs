//! Session Pool Demo
//!
//! Keeps one agent session per conversation, evicting the least recently used
//! one at capacity and expiring idle sessions in the background.
//!
//! Usage:
//!   RUST_LOG=foto_guard=debug cargo run --example session_pool

use async_trait::async_trait;
use foto_guard::{
    HandleFactory, Lifecycle, LifecycleManager, PoolConfig, PooledHandle, ResilienceRegistry,
    ResourcePool, Result,
};
use std::sync::Arc;
use std::time::Duration;

struct AgentSession {
    conversation: String,
}

#[async_trait]
impl PooledHandle for AgentSession {
    async fn close(&self) -> Result<()> {
        println!("  closing session for {}", self.conversation);
        Ok(())
    }
}

struct AgentFactory;

#[async_trait]
impl HandleFactory for AgentFactory {
    type Handle = AgentSession;

    async fn create(&self, key: &str) -> Result<AgentSession> {
        println!("  opening session for {}", key);
        Ok(AgentSession {
            conversation: key.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== foto-guard Session Pool Demo ===\n");

    let pool = Arc::new(ResourcePool::new(
        "agent_sessions",
        PoolConfig::new()
            .with_max_entries(3)
            .with_ttl(Duration::from_millis(300))
            .with_cleanup_interval(Duration::from_millis(100)),
        AgentFactory,
    )?);
    let registry = Arc::new(ResilienceRegistry::new());

    let manager = LifecycleManager::new();
    manager.register(registry.clone() as Arc<dyn Lifecycle>);
    manager.register(pool.clone() as Arc<dyn Lifecycle>);
    manager.start_all().await?;

    println!("Four conversations against a pool of three:");
    for conv in ["conv-a", "conv-b", "conv-c", "conv-a", "conv-d"] {
        pool.get_or_create(conv).await?;
    }
    println!("  recency order: {:?}\n", pool.keys_lru().await);

    println!("Waiting for idle sessions to expire...");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = pool.stats().await;
    println!(
        "  size {}, created {}, evicted {}, expired {}, hit rate {:.2}\n",
        stats.size,
        stats.sessions_created,
        stats.sessions_evicted,
        stats.sessions_expired,
        stats.hit_rate()
    );

    println!("Shutting down:");
    pool.get_or_create("conv-e").await?;
    manager.stop_all().await?;
    Ok(())
}
