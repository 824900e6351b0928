use super::handle::{HandleFactory, PooledHandle};
use crate::lifecycle::Lifecycle;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_entries: usize,
    /// Idle time after which an entry is removed by a sweep.
    pub ttl: Duration,
    /// Period of the background sweeper.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("max_entries", self.max_entries == 0, "max_entries must be at least 1"),
            ("ttl_secs", self.ttl.is_zero(), "ttl must be positive"),
            (
                "cleanup_interval_secs",
                self.cleanup_interval.is_zero(),
                "cleanup interval must be positive",
            ),
        ];
        for (field, invalid, msg) in checks {
            if invalid {
                return Err(Error::configuration_with_context(
                    msg,
                    ErrorContext::new()
                        .with_field_path(format!("pool.{}", field))
                        .with_source("resource_pool"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub sweeper_running: bool,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub sessions_expired: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Entry metadata, read without touching recency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: String,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
}

impl EntryInfo {
    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_accessed)
    }
}

struct Entry<H> {
    handle: Arc<H>,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

struct Counters {
    created: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct Sweeper {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<F: HandleFactory> {
    name: String,
    cfg: PoolConfig,
    factory: F,
    entries: Mutex<LruCache<String, Entry<F::Handle>>>,
    counters: Counters,
}

impl<F: HandleFactory> Inner<F> {
    async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<F::Handle>)> = {
            let mut entries = self.entries.lock().await;
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_accessed) > self.cfg.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|k| entries.pop(&k).map(|e| (k, e.handle)))
                .collect()
        };

        Counters::bump(&self.counters.expired, expired.len() as u64);
        for (key, handle) in &expired {
            close_quietly(&self.name, key, &**handle, "expired").await;
        }
        if !expired.is_empty() {
            info!(pool = %self.name, removed = expired.len(), "swept expired entries");
        }
        expired.len()
    }
}

async fn close_quietly<H: PooledHandle>(pool: &str, key: &str, handle: &H, reason: &str) {
    if let Err(e) = handle.close().await {
        error!(pool = %pool, key = %key, reason, error = %e, "failed to close pooled handle");
    } else {
        debug!(pool = %pool, key = %key, reason, "closed pooled handle");
    }
}

/// Keyed pool of stateful handles with LRU eviction and idle expiry.
///
/// Entries are bounded by `max_entries`; on a miss at capacity the least
/// recently used entry is evicted and closed. A background sweeper started by
/// [`ResourcePool::start`] removes entries idle for longer than `ttl`.
///
/// Handle creation runs while the pool lock is held, so concurrent misses
/// (even for different keys) are created one at a time. On a miss at capacity
/// the new handle is created before the LRU entry is evicted, so a failed
/// create evicts nothing; between the create and the eviction close,
/// `max_entries + 1` handles are live. The evicted handle is closed before
/// the lock is released.
///
/// Dropping a started pool cancels its sweeper. Entries still held are
/// dropped without `close()`; call [`ResourcePool::shutdown`] to close them.
pub struct ResourcePool<F: HandleFactory> {
    inner: Arc<Inner<F>>,
    sweeper: std::sync::Mutex<Option<Sweeper>>,
}

impl<F: HandleFactory> ResourcePool<F> {
    pub fn new(name: impl Into<String>, cfg: PoolConfig, factory: F) -> Result<Self> {
        cfg.validate()?;
        let capacity = NonZeroUsize::new(cfg.max_entries).ok_or_else(|| {
            Error::configuration_with_context(
                "max_entries must be at least 1",
                ErrorContext::new()
                    .with_field_path("pool.max_entries")
                    .with_source("resource_pool"),
            )
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cfg,
                factory,
                entries: Mutex::new(LruCache::new(capacity)),
                counters: Counters::new(),
            }),
            sweeper: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.cfg
    }

    /// Return the handle for `key`, creating it on a miss.
    ///
    /// A factory error is returned as-is and leaves the pool unchanged.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<F::Handle>> {
        let inner = &self.inner;
        let mut entries = inner.entries.lock().await;
        let now = Instant::now();

        if let Some(entry) = entries.get_mut(key) {
            entry.last_accessed = now;
            entry.access_count += 1;
            Counters::bump(&inner.counters.hits, 1);
            debug!(pool = %inner.name, key, access_count = entry.access_count, "pool hit");
            return Ok(Arc::clone(&entry.handle));
        }

        Counters::bump(&inner.counters.misses, 1);
        let handle = Arc::new(inner.factory.create(key).await?);
        Counters::bump(&inner.counters.created, 1);

        let evicted = entries.push(
            key.to_string(),
            Entry {
                handle: Arc::clone(&handle),
                created_at: now,
                last_accessed: now,
                access_count: 1,
            },
        );
        debug!(pool = %inner.name, key, size = entries.len(), "pool entry created");

        // Closed before the lock is released so a lookup of the evicted key
        // cannot open a replacement while the old handle is still live.
        if let Some((old_key, old)) = evicted {
            Counters::bump(&inner.counters.evicted, 1);
            info!(pool = %inner.name, key = %old_key, "evicted least recently used entry");
            close_quietly(&inner.name, &old_key, &*old.handle, "evicted").await;
        }
        drop(entries);
        Ok(handle)
    }

    /// Remove and close the entry for `key`. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().await.pop(key);
        match removed {
            Some(entry) => {
                close_quietly(&self.inner.name, key, &*entry.handle, "removed").await;
                true
            }
            None => false,
        }
    }

    /// Remove every entry idle for longer than `ttl`; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired().await
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().await.contains(key)
    }

    pub async fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let entries = self.inner.entries.lock().await;
        entries.peek(key).map(|e| EntryInfo {
            key: key.to_string(),
            created_at: e.created_at,
            last_accessed: e.last_accessed,
            access_count: e.access_count,
        })
    }

    /// Keys ordered from least to most recently used.
    pub async fn keys_lru(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().await;
        entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the background sweeper. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = slot.as_ref() {
            if !running.task.is_finished() {
                warn!(pool = %self.inner.name, "sweeper already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::clone(&self.inner);
        let interval = inner.cfg.cleanup_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        inner.sweep_expired().await;
                    }
                }
            }
            debug!(pool = %inner.name, "sweeper stopped");
        });
        info!(
            pool = %self.inner.name,
            interval_secs = interval.as_secs(),
            "sweeper started"
        );
        *slot = Some(Sweeper { token, task });
    }

    /// Stop the sweeper, wait for it, then close and drop every entry.
    ///
    /// Safe to call more than once. A sweeper that panicked is reported after
    /// all entries have been closed.
    pub async fn shutdown(&self) -> Result<()> {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut task_err = None;
        if let Some(Sweeper { token, task }) = sweeper {
            token.cancel();
            if let Err(e) = task.await {
                error!(pool = %self.inner.name, error = %e, "sweeper task failed");
                task_err = Some(Error::runtime_with_context(
                    format!("sweeper task failed: {}", e),
                    ErrorContext::new().with_source("resource_pool"),
                ));
            }
        }

        let drained: Vec<(String, Entry<F::Handle>)> = {
            let mut entries = self.inner.entries.lock().await;
            std::iter::from_fn(|| entries.pop_lru()).collect()
        };
        for (key, entry) in &drained {
            close_quietly(&self.inner.name, key, &*entry.handle, "shutdown").await;
        }
        info!(pool = %self.inner.name, closed = drained.len(), "pool shut down");

        match task_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let size = self.len().await;
        let c = &self.inner.counters;
        PoolStats {
            name: self.inner.name.clone(),
            size,
            max_entries: self.inner.cfg.max_entries,
            ttl_secs: self.inner.cfg.ttl.as_secs(),
            cleanup_interval_secs: self.inner.cfg.cleanup_interval.as_secs(),
            sweeper_running: self.is_running(),
            sessions_created: c.created.load(Ordering::Relaxed),
            sessions_evicted: c.evicted.load(Ordering::Relaxed),
            sessions_expired: c.expired.load(Ordering::Relaxed),
            cache_hits: c.hits.load(Ordering::Relaxed),
            cache_misses: c.misses.load(Ordering::Relaxed),
        }
    }
}

impl<F: HandleFactory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        let slot = self.sweeper.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(sweeper) = slot.take() {
            sweeper.token.cancel();
            debug!(pool = %self.inner.name, "pool dropped, sweeper cancelled");
        }
    }
}

#[async_trait]
impl<F: HandleFactory> Lifecycle for ResourcePool<F> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> Result<()> {
        ResourcePool::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await
    }
}
