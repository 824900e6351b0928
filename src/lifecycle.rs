//! 生命周期模块：统一的启动/停止能力与有序的组件管理器。
//!
//! Component lifecycle.
//!
//! Long-lived components (the session pool with its sweeper, the resilience
//! registry) implement [`Lifecycle`]. The composing root registers them with a
//! [`LifecycleManager`], which starts them in registration order and stops them
//! in reverse order.

use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Release background work and owned resources. Must be idempotent.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    components: RwLock<Vec<Arc<dyn Lifecycle>>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, component: Arc<dyn Lifecycle>) {
        self.components
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(component);
    }

    pub fn names(&self) -> Vec<String> {
        self.list().iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list(&self) -> Vec<Arc<dyn Lifecycle>> {
        self.components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start every component in registration order, stopping at the first failure.
    pub async fn start_all(&self) -> Result<()> {
        for c in self.list() {
            c.start().await?;
            info!(component = c.name(), "component started");
        }
        Ok(())
    }

    /// Stop every component in reverse registration order.
    ///
    /// A failing component does not prevent the rest from stopping; the first
    /// error is returned once all have been attempted.
    pub async fn stop_all(&self) -> Result<()> {
        let mut first_err = None;
        for c in self.list().into_iter().rev() {
            match c.stop().await {
                Ok(()) => info!(component = c.name(), "component stopped"),
                Err(e) => {
                    error!(component = c.name(), error = %e, "component failed to stop");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
