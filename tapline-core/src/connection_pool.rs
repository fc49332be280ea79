//! Connection pooling for server pipes
//!
//! Idle server pipes are kept per pool key on a LIFO stack so the most recently
//! active socket, the one most likely still healthy, is reused first. Aged pipes
//! are scavenged on a schedule rather than on every access.
//!
//! Locking: the key map (DashMap shard lock) is always taken before a stack's
//! mutex, never the other way round. Pipes are closed only after both are
//! released.

use crate::pipe::ServerPipe;
use crate::scheduler::{Scheduler, TaskId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Builds the key variant reserved for pipes married to client process `pid`
pub fn process_scoped_key(pid: u32, key: &str) -> String {
    format!("pid{}*{}", pid, key)
}

fn is_degenerate_key(key: &str) -> bool {
    let key = key.trim();
    key.is_empty() || key.ends_with('*')
}

/// Configuration for connection pooling
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle pipes per pool key (default: 64)
    pub max_per_key: usize,
    /// Longest a pipe may sit idle in the pool (default: 115s)
    pub pooled_lifetime: Duration,
    /// How often the scavenger runs (default: 30s)
    pub scavenge_interval: Duration,
    /// Enable connection pooling (default: true)
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 64,
            pooled_lifetime: Duration::from_secs(115),
            scavenge_interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

impl From<&tapline_config::ConnectionPool> for PoolConfig {
    fn from(c: &tapline_config::ConnectionPool) -> Self {
        Self {
            max_per_key: c.max_per_key,
            pooled_lifetime: Duration::from_secs(c.pooled_lifetime),
            scavenge_interval: Duration::from_secs(c.scavenge_interval),
            enabled: c.enabled,
        }
    }
}

/// Metrics for connection pool
struct PoolMetrics {
    pool_hits: IntCounter,
    pool_misses: IntCounter,
    pool_evictions: IntCounter,
    pool_size: IntGauge,
}

impl PoolMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pool_hits = IntCounter::new(
            "tapline_pool_hits_total",
            "Total connection pool hits (reused server pipes)",
        )?;
        let pool_misses = IntCounter::new(
            "tapline_pool_misses_total",
            "Total connection pool misses",
        )?;
        let pool_evictions = IntCounter::new(
            "tapline_pool_evictions_total",
            "Total server pipes closed instead of pooled or evicted from the pool",
        )?;
        let pool_size = IntGauge::new("tapline_pool_size", "Current number of pooled pipes")?;

        registry.register(Box::new(pool_hits.clone()))?;
        registry.register(Box::new(pool_misses.clone()))?;
        registry.register(Box::new(pool_evictions.clone()))?;
        registry.register(Box::new(pool_size.clone()))?;

        Ok(Self {
            pool_hits,
            pool_misses,
            pool_evictions,
            pool_size,
        })
    }
}

type PipeStack = Arc<Mutex<Vec<ServerPipe>>>;

/// Pool of idle server pipes
pub struct ConnectionPool {
    pools: DashMap<String, PipeStack>,
    config: PoolConfig,
    last_full_purge: RwLock<Option<Instant>>,
    metrics: Option<PoolMetrics>,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            last_full_purge: RwLock::new(None),
            metrics: None,
        }
    }

    /// Create a new connection pool with metrics
    pub fn with_metrics(
        config: PoolConfig,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let metrics = PoolMetrics::new(registry)?;
        Ok(Self {
            metrics: Some(metrics),
            ..Self::new(config)
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes the most recently pooled pipe for `key`
    ///
    /// With a non-zero `pid`, pipes married to that client process are tried
    /// first. Pooled pipes that turned readable while idle (peer closed or sent
    /// unsolicited data) are closed and skipped.
    pub fn take_pipe(&self, key: &str, pid: u32) -> Option<ServerPipe> {
        if !self.config.enabled {
            return None;
        }

        let found = if pid != 0 {
            self.pop(&process_scoped_key(pid, key))
                .or_else(|| self.pop(key))
        } else {
            self.pop(key)
        };

        match found {
            Some(pipe) => {
                debug!(key, pipe = pipe.id(), "Connection pool hit");
                if let Some(ref metrics) = self.metrics {
                    metrics.pool_hits.inc();
                }
                Some(pipe)
            }
            None => {
                debug!(key, "Connection pool miss");
                if let Some(ref metrics) = self.metrics {
                    metrics.pool_misses.inc();
                }
                None
            }
        }
    }

    fn pop(&self, key: &str) -> Option<ServerPipe> {
        let stack = self.pools.get(key)?.value().clone();

        loop {
            let mut pipe = stack.lock().pop()?;
            if let Some(ref metrics) = self.metrics {
                metrics.pool_size.dec();
            }

            if pipe.is_connected() && !pipe.has_data_available() {
                return Some(pipe);
            }

            debug!(key, pipe = pipe.id(), "Discarding pooled pipe closed by peer");
            pipe.end();
            if let Some(ref metrics) = self.metrics {
                metrics.pool_evictions.inc();
            }
        }
    }

    /// Returns `pipe` to the pool when its policy and age allow, else closes it
    ///
    /// Returns true if the pipe was pooled.
    pub fn pool_or_close_pipe(&self, pipe: ServerPipe) -> bool {
        let (mut pipe, rejected) = match self.try_push(pipe) {
            Ok(()) => return true,
            Err(rejected) => rejected,
        };

        debug!(
            key = pipe.pool_key(),
            pipe = pipe.id(),
            reason = rejected,
            "Closing server pipe instead of pooling"
        );
        pipe.end();
        if let Some(ref metrics) = self.metrics {
            metrics.pool_evictions.inc();
        }
        false
    }

    fn try_push(&self, mut pipe: ServerPipe) -> Result<(), (ServerPipe, &'static str)> {
        if !self.config.enabled {
            return Err((pipe, "pooling disabled"));
        }
        if !pipe.reuse_policy().allows_pooling() {
            return Err((pipe, "reuse policy"));
        }
        if is_degenerate_key(pipe.pool_key()) {
            return Err((pipe, "no pool key"));
        }
        if !pipe.is_connected() {
            return Err((pipe, "already closed"));
        }

        let key = pipe.pool_key().to_string();
        let entry = self.pools.entry(key).or_default();
        let mut stack = entry.value().lock();

        // Checked under the stack lock so a concurrent clear() cannot miss it
        if self
            .last_full_purge
            .read()
            .is_some_and(|purged| pipe.connected_at() <= purged)
        {
            drop(stack);
            return Err((pipe, "connected before last purge"));
        }
        if stack.len() >= self.config.max_per_key {
            drop(stack);
            return Err((pipe, "pool full for key"));
        }

        pipe.stamp_pooled(Instant::now());
        debug!(
            key = entry.key().as_str(),
            pipe = pipe.id(),
            pool_size = stack.len() + 1,
            "Returned pipe to pool"
        );
        stack.push(pipe);

        if let Some(ref metrics) = self.metrics {
            metrics.pool_size.inc();
        }
        Ok(())
    }

    /// Evicts pipes idle longer than the pooled lifetime
    pub fn scavenge_cache(&self) {
        let lifetime = self.config.pooled_lifetime;
        let now = Instant::now();
        let is_stale = |pipe: &ServerPipe| {
            pipe.last_pooled()
                .is_none_or(|pooled| now.duration_since(pooled) > lifetime)
        };

        let stacks: Vec<(String, PipeStack)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = Vec::new();
        for (key, stack) in &stacks {
            let mut stack = stack.lock();
            let before = evicted.len();

            // Newest on top: if it is stale, all of them are
            if stack.last().is_some_and(is_stale) {
                evicted.append(&mut stack);
            } else if stack.first().is_some_and(is_stale) {
                let (stale, fresh): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut *stack).into_iter().partition(is_stale);
                *stack = fresh;
                evicted.extend(stale);
            }

            if evicted.len() > before {
                debug!(key = key.as_str(), evicted = evicted.len() - before, "Scavenged pooled pipes");
            }
        }

        self.pools.retain(|_, stack| !stack.lock().is_empty());

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Connection pool scavenge complete");
            if let Some(ref metrics) = self.metrics {
                metrics.pool_evictions.inc_by(evicted.len() as u64);
                metrics.pool_size.sub(evicted.len() as i64);
            }
        }

        for mut pipe in evicted {
            pipe.end();
        }
    }

    /// Closes every pooled pipe and refuses pipes connected before now
    pub fn clear(&self) {
        *self.last_full_purge.write() = Some(Instant::now());

        let mut evicted = Vec::new();
        self.pools.retain(|_, stack| {
            evicted.append(&mut stack.lock());
            false
        });

        info!(closed = evicted.len(), "Connection pool cleared");
        if let Some(ref metrics) = self.metrics {
            metrics.pool_evictions.inc_by(evicted.len() as u64);
            metrics.pool_size.sub(evicted.len() as i64);
        }

        for mut pipe in evicted {
            pipe.end();
        }
    }

    /// Get statistics about the pool
    pub fn stats(&self) -> PoolStats {
        let stacks: Vec<PipeStack> = self.pools.iter().map(|e| e.value().clone()).collect();
        let total_pipes = stacks.iter().map(|s| s.lock().len()).sum();

        PoolStats {
            total_pipes,
            keys: stacks.len(),
            enabled: self.config.enabled,
        }
    }

    /// Runs [`scavenge_cache`](Self::scavenge_cache) on the scheduler's periodic worker
    pub fn register_scavenger(self: &Arc<Self>, scheduler: &Scheduler) -> TaskId {
        let pool = Arc::downgrade(self);
        scheduler.add_periodic("pool-scavenge", self.config.scavenge_interval, move || {
            if let Some(pool) = pool.upgrade() {
                pool.scavenge_cache();
            }
        })
    }
}

/// Statistics about the connection pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_pipes: usize,
    pub keys: usize,
    pub enabled: bool,
}
