//! Per-provider pool management
//!
//! [`ConnectionPoolManager`] owns one [`ConnectionPool`] per provider key,
//! created lazily on first acquire, and tracks usage metrics for each.
//! It is constructed by the application and shared as an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::events::{EventEmitter, SubscriptionId};
use crate::pool::{ConnectionPool, PoolHealthReport};
use crate::provider::{Connection, ConnectionFactory};

/// Usage counters for one provider's pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMetrics {
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub total_timeouts: u64,
    pub total_failures: u64,
    /// Mean time callers spent in `acquire`
    pub average_wait_ms: f64,
}

/// Snapshot of one provider's pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub metrics: PoolMetrics,
}

/// Notifications emitted by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    ConnectionAcquired { provider: String, wait: Duration },
    ConnectionReleased { provider: String },
    AcquireTimedOut { provider: String },
    PoolCleared { provider: String },
}

#[derive(Default)]
struct MetricsTracker {
    metrics: Mutex<PoolMetrics>,
}

impl MetricsTracker {
    fn record_acquire(&self, wait: Duration) {
        let mut metrics = self.metrics.lock();
        metrics.total_acquired += 1;
        let n = metrics.total_acquired as f64;
        let wait_ms = wait.as_secs_f64() * 1000.0;
        metrics.average_wait_ms += (wait_ms - metrics.average_wait_ms) / n;
    }

    fn record_release(&self) {
        self.metrics.lock().total_released += 1;
    }

    fn record_timeout(&self) {
        self.metrics.lock().total_timeouts += 1;
    }

    fn record_failure(&self) {
        self.metrics.lock().total_failures += 1;
    }

    fn snapshot(&self) -> PoolMetrics {
        self.metrics.lock().clone()
    }
}

#[derive(Clone)]
struct ProviderPool {
    pool: ConnectionPool,
    metrics: Arc<MetricsTracker>,
}

/// Owns a bounded pool per provider key
pub struct ConnectionPoolManager {
    factory: Arc<dyn ConnectionFactory>,
    default_config: PoolConfig,
    provider_configs: HashMap<String, PoolConfig>,
    pools: Mutex<HashMap<String, ProviderPool>>,
    events: EventEmitter<PoolEvent>,
    disposed: AtomicBool,
}

impl ConnectionPoolManager {
    /// Creates a manager whose pools all use `config`
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            default_config: config,
            provider_configs: HashMap::new(),
            pools: Mutex::new(HashMap::new()),
            events: EventEmitter::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Overrides the pool configuration for one provider
    pub fn with_provider_config(mut self, provider_key: impl Into<String>, config: PoolConfig) -> Self {
        self.provider_configs.insert(provider_key.into(), config);
        self
    }

    pub fn config_for(&self, provider_key: &str) -> &PoolConfig {
        self.provider_configs
            .get(provider_key)
            .unwrap_or(&self.default_config)
    }

    fn pool_for(&self, provider_key: &str) -> Result<ProviderPool> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::PoolDisposed(provider_key.to_string()));
        }

        let mut pools = self.pools.lock();
        let entry = pools.entry(provider_key.to_string()).or_insert_with(|| {
            debug!("Creating connection pool for '{}'", provider_key);
            ProviderPool {
                pool: ConnectionPool::new(
                    provider_key,
                    Arc::clone(&self.factory),
                    self.config_for(provider_key).clone(),
                ),
                metrics: Arc::new(MetricsTracker::default()),
            }
        });
        Ok(entry.clone())
    }

    fn existing(&self, provider_key: &str) -> Option<ProviderPool> {
        self.pools.lock().get(provider_key).cloned()
    }

    /// Acquires a connection to `provider_key`, creating its pool on first use
    ///
    /// # Errors
    /// `ConnectionTimeout` when no connection frees up in time; provider errors
    /// from connection creation are returned unchanged.
    pub async fn acquire(&self, provider_key: &str) -> Result<Arc<dyn Connection>> {
        let entry = self.pool_for(provider_key)?;
        let started = Instant::now();

        match entry.pool.acquire().await {
            Ok(connection) => {
                let wait = started.elapsed();
                entry.metrics.record_acquire(wait);
                self.events.emit(&PoolEvent::ConnectionAcquired {
                    provider: provider_key.to_string(),
                    wait,
                });
                Ok(connection)
            }
            Err(e @ Error::ConnectionTimeout { .. }) => {
                entry.metrics.record_timeout();
                self.events.emit(&PoolEvent::AcquireTimedOut {
                    provider: provider_key.to_string(),
                });
                Err(e)
            }
            Err(e) => {
                entry.metrics.record_failure();
                warn!("Failed to acquire connection for '{}': {}", provider_key, e);
                Err(e)
            }
        }
    }

    /// Returns a connection to its provider's pool
    ///
    /// # Returns
    /// False if the provider has no pool or the connection was not in use
    pub fn release(&self, provider_key: &str, connection: Arc<dyn Connection>) -> bool {
        let Some(entry) = self.existing(provider_key) else {
            warn!("Ignoring release for unknown provider '{}'", provider_key);
            return false;
        };

        if !entry.pool.release(connection) {
            return false;
        }
        entry.metrics.record_release();
        self.events.emit(&PoolEvent::ConnectionReleased {
            provider: provider_key.to_string(),
        });
        true
    }

    /// Disconnects every connection for `provider_key` and forgets the pool
    ///
    /// # Returns
    /// False if the provider had no pool
    pub async fn clear(&self, provider_key: &str) -> bool {
        let removed = self.pools.lock().remove(provider_key);
        let Some(entry) = removed else {
            return false;
        };

        entry.pool.dispose().await;
        info!("Cleared connection pool for '{}'", provider_key);
        self.events.emit(&PoolEvent::PoolCleared {
            provider: provider_key.to_string(),
        });
        true
    }

    /// Current stats for a provider, or `None` if it has no pool
    pub fn get_stats(&self, provider_key: &str) -> Option<PoolStats> {
        let entry = self.existing(provider_key)?;
        let snapshot = entry.pool.stats();
        let mut metrics = entry.metrics.snapshot();
        metrics.total_created = snapshot.total_created;

        Some(PoolStats {
            available: snapshot.available,
            in_use: snapshot.in_use,
            waiting: snapshot.waiting,
            metrics,
        })
    }

    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pools.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn check_health(&self, provider_key: &str) -> Option<PoolHealthReport> {
        let entry = self.existing(provider_key)?;
        Some(entry.pool.check_health().await)
    }

    /// Pre-creates `min_size` connections for a provider
    pub async fn warm_up(&self, provider_key: &str) -> Result<usize> {
        self.pool_for(provider_key)?.pool.warm_up().await
    }

    /// Evicts idle connections across all pools
    pub async fn evict_idle(&self) -> usize {
        let pools: Vec<ProviderPool> = self.pools.lock().values().cloned().collect();
        let mut evicted = 0;
        for entry in pools {
            evicted += entry.pool.evict_idle().await;
        }
        evicted
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Clears every provider, then drops all subscriptions
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for key in self.provider_keys() {
            self.clear(&key).await;
        }
        self.events.clear();
        info!("Connection pool manager disposed");
    }
}
