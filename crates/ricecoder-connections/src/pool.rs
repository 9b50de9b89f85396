//! Bounded connection pool for a single provider
//!
//! The pool hands out connections created by a [`ConnectionFactory`]. When all
//! `max_size` slots are in use, callers queue up and are served strictly in
//! arrival order: a released connection goes straight to the oldest waiter and
//! never passes through the idle list.
//!
//! Invariant: the idle list is non-empty only while no caller is waiting.
//! Releases hand off to waiters before idling, and acquire only queues when
//! nothing is idle and the pool is full.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::provider::{Connection, ConnectionFactory};

/// A connection tracked by the pool
#[derive(Clone)]
pub struct PooledConnection {
    pub connection: Arc<dyn Connection>,
    pub is_active: bool,
    pub last_used_at: Instant,
}

impl PooledConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            is_active: true,
            last_used_at: Instant::now(),
        }
    }

    fn activate(&mut self) {
        self.is_active = true;
        self.last_used_at = Instant::now();
    }

    fn deactivate(&mut self) {
        self.is_active = false;
        self.last_used_at = Instant::now();
    }

    fn is(&self, connection: &Arc<dyn Connection>) -> bool {
        Arc::ptr_eq(&self.connection, connection)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("is_active", &self.is_active)
            .field("last_used_at", &self.last_used_at)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
    /// Connections currently being created
    pub pending: usize,
    pub total_created: u64,
    pub max_size: usize,
}

/// Availability of one connection from [`ConnectionPool::check_health`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub in_use: bool,
    pub is_healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHealthReport {
    pub is_healthy: bool,
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub results: Vec<ConnectionHealth>,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<Arc<dyn Connection>>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConnection>,
    in_use: Vec<PooledConnection>,
    waiters: VecDeque<Waiter>,
    pending: usize,
    next_waiter_id: u64,
    total_created: u64,
    disposed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }

    /// Drops waiters whose acquire future was cancelled
    fn prune_waiters(&mut self) {
        self.waiters.retain(|waiter| !waiter.sender.is_closed());
    }

    fn live_waiters(&self) -> usize {
        self.waiters
            .iter()
            .filter(|waiter| !waiter.sender.is_closed())
            .count()
    }

    /// Gives the connection to the oldest live waiter, or idles it
    ///
    /// Returns true if a waiter received it.
    fn hand_off(&mut self, mut pooled: PooledConnection) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.send(Arc::clone(&pooled.connection)) {
                Ok(()) => {
                    pooled.activate();
                    self.in_use.push(pooled);
                    return true;
                }
                // Waiter gave up; try the next one
                Err(_) => continue,
            }
        }

        pooled.deactivate();
        self.idle.push_back(pooled);
        false
    }
}

struct PoolInner {
    provider_key: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Reserves a creation slot if capacity allows
    fn reserve_slot(self: &Arc<Self>, state: &mut PoolState) -> Option<PendingSlot> {
        if state.total() >= self.config.max_size {
            return None;
        }
        state.pending += 1;
        Some(PendingSlot {
            inner: Arc::clone(self),
            armed: true,
        })
    }

    /// Creates a connection for the oldest waiter when a slot was freed
    /// without a release
    fn backfill(self: &Arc<Self>) {
        let slot = {
            let mut state = self.state.lock();
            if state.disposed || state.live_waiters() == 0 {
                return;
            }
            match self.reserve_slot(&mut state) {
                Some(slot) => slot,
                None => return,
            }
        };

        let inner = Arc::clone(self);
        debug!("Creating connection for queued waiter on '{}'", inner.provider_key);
        tokio::spawn(async move {
            match inner.factory.create_connection(&inner.provider_key).await {
                Ok(connection) => {
                    if let Err(connection) = slot.fill(connection, SlotTarget::HandOff) {
                        disconnect_quietly(&inner.provider_key, &connection).await;
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to create connection for queued waiter on '{}': {}",
                        inner.provider_key, e
                    );
                    slot.cancel();
                }
            }
        });
    }
}

enum SlotTarget {
    /// The caller keeps the connection
    Caller,
    /// Hand to the oldest waiter or idle it
    HandOff,
}

/// Capacity reserved for a connection that is being created
///
/// Dropping an armed slot (for example when the acquiring future is
/// cancelled) gives the capacity back.
struct PendingSlot {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl PendingSlot {
    /// Turns the reservation into a tracked connection
    ///
    /// Fails with the connection if the pool was disposed meanwhile.
    fn fill(
        mut self,
        connection: Arc<dyn Connection>,
        target: SlotTarget,
    ) -> std::result::Result<(), Arc<dyn Connection>> {
        self.armed = false;
        let mut state = self.inner.state.lock();
        state.pending -= 1;
        if state.disposed {
            return Err(connection);
        }

        state.total_created += 1;
        let pooled = PooledConnection::new(connection);
        match target {
            SlotTarget::Caller => state.in_use.push(pooled),
            SlotTarget::HandOff => {
                state.hand_off(pooled);
            }
        }
        Ok(())
    }

    /// Gives the capacity back without scheduling another backfill
    fn cancel(mut self) {
        self.armed = false;
        self.inner.state.lock().pending -= 1;
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            self.inner.backfill();
        }
    }
}

async fn disconnect_quietly(provider_key: &str, connection: &Arc<dyn Connection>) {
    if let Err(e) = connection.disconnect().await {
        warn!("Ignoring disconnect error for '{}': {}", provider_key, e);
    }
}

enum AcquireStep {
    Ready(Arc<dyn Connection>),
    Create(PendingSlot),
    Wait(u64, oneshot::Receiver<Arc<dyn Connection>>),
}

/// Bounded pool of connections to one provider
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are created on demand
    pub fn new(
        provider_key: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider_key: provider_key.into(),
                config,
                factory,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Returns the provider key this pool serves
    pub fn provider_key(&self) -> &str {
        &self.inner.provider_key
    }

    /// Returns the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection from the pool
    ///
    /// Reuses an idle connection, creates one while below `max_size`, and
    /// otherwise waits up to `acquire_timeout` for a release.
    ///
    /// # Errors
    /// `ConnectionTimeout` when the wait expires, `PoolDisposed` when the pool
    /// is torn down, or the factory's error when creation fails.
    pub async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        let key = &self.inner.provider_key;

        let step = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(Error::PoolDisposed(key.clone()));
            }

            state.prune_waiters();
            if state.waiters.is_empty() {
                if let Some(mut pooled) = state.idle.pop_front() {
                    pooled.activate();
                    let connection = Arc::clone(&pooled.connection);
                    state.in_use.push(pooled);
                    AcquireStep::Ready(connection)
                } else if let Some(slot) = self.inner.reserve_slot(&mut state) {
                    AcquireStep::Create(slot)
                } else {
                    Self::enqueue(&mut state)
                }
            } else {
                Self::enqueue(&mut state)
            }
        };

        match step {
            AcquireStep::Ready(connection) => {
                debug!("Reused idle connection for '{}'", key);
                Ok(connection)
            }
            AcquireStep::Create(slot) => {
                let connection = self.inner.factory.create_connection(key).await?;
                match slot.fill(Arc::clone(&connection), SlotTarget::Caller) {
                    Ok(()) => {
                        info!("Created new connection for '{}'", key);
                        Ok(connection)
                    }
                    Err(connection) => {
                        disconnect_quietly(key, &connection).await;
                        Err(Error::PoolDisposed(key.clone()))
                    }
                }
            }
            AcquireStep::Wait(id, receiver) => self.wait_for_release(id, receiver).await,
        }
    }

    fn enqueue(state: &mut PoolState) -> AcquireStep {
        let (sender, receiver) = oneshot::channel();
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(Waiter { id, sender });
        AcquireStep::Wait(id, receiver)
    }

    async fn wait_for_release(
        &self,
        id: u64,
        mut receiver: oneshot::Receiver<Arc<dyn Connection>>,
    ) -> Result<Arc<dyn Connection>> {
        let key = &self.inner.provider_key;
        let timeout = self.inner.config.acquire_timeout();
        debug!("Waiting up to {:?} for a connection to '{}'", timeout, key);

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(_)) => Err(Error::PoolDisposed(key.clone())),
            Err(_) => {
                let withdrawn = {
                    let mut state = self.inner.state.lock();
                    match state.waiters.iter().position(|waiter| waiter.id == id) {
                        Some(position) => {
                            state.waiters.remove(position);
                            true
                        }
                        None => false,
                    }
                };

                if withdrawn {
                    warn!("Timed out waiting for a connection to '{}'", key);
                    return Err(Error::ConnectionTimeout {
                        provider: key.clone(),
                        timeout_ms: self.inner.config.acquire_timeout_ms,
                    });
                }

                // A release served us under the lock right at the deadline
                receiver
                    .try_recv()
                    .map_err(|_| Error::PoolDisposed(key.clone()))
            }
        }
    }

    /// Returns a connection to the pool
    ///
    /// The oldest waiter, if any, receives this exact connection. Releasing a
    /// connection the pool does not consider in use is ignored.
    ///
    /// # Returns
    /// False if the connection was not in use
    pub fn release(&self, connection: Arc<dyn Connection>) -> bool {
        let key = &self.inner.provider_key;
        let handed_off = {
            let mut state = self.inner.state.lock();
            let Some(position) = state.in_use.iter().position(|p| p.is(&connection)) else {
                warn!("Ignoring release of a connection not in use by '{}'", key);
                return false;
            };
            let pooled = state.in_use.swap_remove(position);
            state.hand_off(pooled)
        };

        if handed_off {
            debug!("Handed released connection to waiter on '{}'", key);
        } else {
            debug!("Connection returned to idle list for '{}'", key);
        }
        true
    }

    /// Drops a broken in-use connection and frees its slot
    pub async fn discard(&self, connection: Arc<dyn Connection>) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.in_use.iter().position(|p| p.is(&connection)) {
                Some(position) => {
                    state.in_use.swap_remove(position);
                    true
                }
                None => false,
            }
        };

        if !removed {
            warn!(
                "Ignoring discard of a connection not in use by '{}'",
                self.inner.provider_key
            );
            return false;
        }

        info!("Discarding connection for '{}'", self.inner.provider_key);
        disconnect_quietly(&self.inner.provider_key, &connection).await;
        self.inner.backfill();
        true
    }

    /// Creates connections until the pool holds `min_size`
    ///
    /// # Returns
    /// Number of connections created
    pub async fn warm_up(&self) -> Result<usize> {
        let mut created = 0;
        loop {
            let slot = {
                let mut state = self.inner.state.lock();
                if state.disposed {
                    return Err(Error::PoolDisposed(self.inner.provider_key.clone()));
                }
                if state.total() >= self.inner.config.min_size {
                    break;
                }
                match self.inner.reserve_slot(&mut state) {
                    Some(slot) => slot,
                    None => break,
                }
            };

            let connection = self
                .inner
                .factory
                .create_connection(&self.inner.provider_key)
                .await?;
            if let Err(connection) = slot.fill(connection, SlotTarget::HandOff) {
                disconnect_quietly(&self.inner.provider_key, &connection).await;
                return Err(Error::PoolDisposed(self.inner.provider_key.clone()));
            }
            created += 1;
        }

        if created > 0 {
            info!(
                "Warmed up {} connections for '{}'",
                created, self.inner.provider_key
            );
        }
        Ok(created)
    }

    /// Closes idle connections unused for longer than `idle_timeout`,
    /// keeping at least `min_size` connections
    ///
    /// # Returns
    /// Number of connections closed
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let expired: Vec<PooledConnection> = {
            let mut state = self.inner.state.lock();
            let mut removable = state.total().saturating_sub(self.inner.config.min_size);
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();

            while let Some(pooled) = state.idle.pop_front() {
                if removable > 0 && pooled.last_used_at.elapsed() >= idle_timeout {
                    removable -= 1;
                    expired.push(pooled);
                } else {
                    kept.push_back(pooled);
                }
            }
            state.idle = kept;
            expired
        };

        for pooled in &expired {
            disconnect_quietly(&self.inner.provider_key, &pooled.connection).await;
        }
        if !expired.is_empty() {
            info!(
                "Evicted {} idle connections for '{}'",
                expired.len(),
                self.inner.provider_key
            );
        }
        expired.len()
    }

    /// Probes every known connection concurrently
    pub async fn check_health(&self) -> PoolHealthReport {
        let connections: Vec<(bool, Arc<dyn Connection>)> = {
            let state = self.inner.state.lock();
            state
                .idle
                .iter()
                .map(|p| (false, Arc::clone(&p.connection)))
                .chain(state.in_use.iter().map(|p| (true, Arc::clone(&p.connection))))
                .collect()
        };

        let probes = connections.iter().map(|(in_use, connection)| async move {
            match connection.is_available().await {
                Ok(is_healthy) => ConnectionHealth {
                    in_use: *in_use,
                    is_healthy,
                    error: None,
                },
                Err(e) => ConnectionHealth {
                    in_use: *in_use,
                    is_healthy: false,
                    error: Some(e.to_string()),
                },
            }
        });
        let results = join_all(probes).await;

        let healthy_connections = results.iter().filter(|r| r.is_healthy).count();
        debug!(
            "Pool health for '{}': {}/{} healthy",
            self.inner.provider_key,
            healthy_connections,
            results.len()
        );

        PoolHealthReport {
            is_healthy: healthy_connections == results.len(),
            total_connections: results.len(),
            healthy_connections,
            results,
        }
    }

    /// Returns a point-in-time view of the pool
    pub fn stats(&self) -> PoolSnapshot {
        let state = self.inner.state.lock();
        PoolSnapshot {
            available: state.idle.len(),
            in_use: state.in_use.len(),
            waiting: state.live_waiters(),
            pending: state.pending,
            total_created: state.total_created,
            max_size: self.inner.config.max_size,
        }
    }

    /// Returns true once [`ConnectionPool::dispose`] has run
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Disconnects every connection and rejects queued and future acquires
    ///
    /// Disconnect errors are logged and ignored so teardown always completes.
    pub async fn dispose(&self) {
        let connections: Vec<PooledConnection> = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            // Dropping the senders fails every waiter with PoolDisposed
            state.waiters.clear();
            let mut connections: Vec<PooledConnection> = state.idle.drain(..).collect();
            connections.append(&mut state.in_use);
            connections
        };

        let key = &self.inner.provider_key;
        join_all(
            connections
                .iter()
                .map(|pooled| disconnect_quietly(key, &pooled.connection)),
        )
        .await;

        info!("Disposed pool for '{}' ({} connections)", key, connections.len());
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("provider_key", &self.inner.provider_key)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ProviderError;
    use crate::testing::{is_same_connection, MockConnectionFactory};

    fn pool_with(max_size: usize, acquire_timeout_ms: u64) -> (ConnectionPool, Arc<MockConnectionFactory>) {
        let factory = Arc::new(MockConnectionFactory::new());
        let config = PoolConfig {
            max_size,
            acquire_timeout_ms,
            ..Default::default()
        };
        (ConnectionPool::new("ollama", factory.clone(), config), factory)
    }

    #[tokio::test]
    async fn test_create_pool() {
        let (pool, factory) = pool_with(2, 1000);
        assert_eq!(pool.stats(), PoolSnapshot { max_size: 2, ..Default::default() });
        assert_eq!(factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_stats_after_acquire_and_release() {
        let (pool, _) = pool_with(1, 1000);
        let conn = pool.acquire().await.unwrap();
        assert!(pool.release(conn));

        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.waiting), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_reuse_connection() {
        let (pool, factory) = pool_with(2, 1000);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created_count(), 2);

        pool.release(Arc::clone(&a));
        let again = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&again, &a));
        assert_eq!(factory.created_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let (pool, _) = pool_with(1, 100);
        let _held = pool.acquire().await.unwrap();

        let start = tokio::time::Instant::now();
        let result = pool.acquire().await;
        let elapsed = start.elapsed();

        assert_eq!(
            result.err(),
            Some(Error::ConnectionTimeout {
                provider: "ollama".to_string(),
                timeout_ms: 100
            })
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(110));

        let stats = pool.stats();
        assert_eq!((stats.in_use, stats.waiting), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let (pool, factory) = pool_with(1, 10_000);
        let first = pool.acquire().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                tx.send((i, Arc::clone(&conn))).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(conn);
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(pool.stats().waiting, 3);
        assert!(rx.try_recv().is_err());

        pool.release(Arc::clone(&first));
        let mut order = Vec::new();
        for _ in 0..3 {
            let (i, conn) = rx.recv().await.unwrap();
            assert!(Arc::ptr_eq(&conn, &first));
            order.push(i);
        }

        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_bypasses_new_acquirers() {
        let (pool, _) = pool_with(1, 10_000);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.release(Arc::clone(&held));
        // The queued waiter owns it now, so nothing is idle for a newcomer
        assert_eq!(pool.stats().available, 0);

        let served = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&served, &held));
    }

    #[tokio::test]
    async fn test_release_unknown_connection_is_noop() {
        let (pool, _) = pool_with(1, 1000);
        let conn = pool.acquire().await.unwrap();
        assert!(pool.release(Arc::clone(&conn)));
        assert!(!pool.release(conn));

        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use), (1, 0));
    }

    #[tokio::test]
    async fn test_creation_error_surfaces_and_frees_slot() {
        let (pool, factory) = pool_with(1, 1000);
        factory.fail_next(1, ProviderError::NetworkError("refused".to_string()));

        let result = pool.acquire().await;
        assert_eq!(
            result.err(),
            Some(Error::Provider(ProviderError::NetworkError(
                "refused".to_string()
            )))
        );
        assert_eq!(pool.stats().pending, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_block_creation() {
        let (pool, factory) = pool_with(1, 1000);
        factory.set_create_delay(Duration::from_millis(50));
        factory.fail_next(1, ProviderError::NetworkError("refused".to_string()));

        let creating = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.stats().pending == 0 {
            tokio::task::yield_now().await;
        }

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.stats().waiting == 0 {
            tokio::task::yield_now().await;
        }
        queued.abort();
        assert!(queued.await.unwrap_err().is_cancelled());

        assert!(creating.await.unwrap().is_err());
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use, stats.pending), (0, 0, 0));

        let start = tokio::time::Instant::now();
        assert!(pool.acquire().await.is_ok());
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_creates_connection_for_waiter() {
        let (pool, factory) = pool_with(1, 10_000);
        let broken = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(pool.discard(Arc::clone(&broken)).await);
        let replacement = waiter.await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&replacement, &broken));
        assert_eq!(factory.created_count(), 2);
        assert_eq!(factory.created()[0].disconnect_calls(), 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_dispose_disconnects_everything() {
        let (pool, factory) = pool_with(2, 1000);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        pool.release(a);
        factory.created()[1].fail_disconnects(ProviderError::NetworkError("gone".to_string()));

        pool.dispose().await;

        for conn in factory.created() {
            assert_eq!(conn.disconnect_calls(), 1);
        }
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use), (0, 0));
        assert!(matches!(pool.acquire().await, Err(Error::PoolDisposed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_fails_waiters() {
        let (pool, _) = pool_with(1, 10_000);
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.dispose().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::PoolDisposed(_))
        ));
    }

    #[tokio::test]
    async fn test_check_health() {
        let (pool, factory) = pool_with(3, 1000);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        pool.release(a);

        let report = pool.check_health().await;
        assert!(report.is_healthy);
        assert_eq!(report.total_connections, 2);

        factory.created()[1].set_availability(Err(ProviderError::Timeout(50)));
        let report = pool.check_health().await;
        assert!(!report.is_healthy);
        assert_eq!(report.healthy_connections, 1);
        let failed = report.results.iter().find(|r| !r.is_healthy).unwrap();
        assert!(failed.in_use);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_warm_up_creates_min_size() {
        let factory = Arc::new(MockConnectionFactory::new());
        let config = PoolConfig {
            max_size: 4,
            min_size: 2,
            ..Default::default()
        };
        let pool = ConnectionPool::new("lmstudio", factory.clone(), config);

        assert_eq!(pool.warm_up().await.unwrap(), 2);
        assert_eq!(pool.warm_up().await.unwrap(), 0);
        assert_eq!(pool.stats().available, 2);

        let conn = pool.acquire().await.unwrap();
        assert!(is_same_connection(&conn, &factory.created()[0]));
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_min_size() {
        let factory = Arc::new(MockConnectionFactory::new());
        let config = PoolConfig {
            max_size: 3,
            min_size: 1,
            idle_timeout_ms: 0,
            ..Default::default()
        };
        let pool = ConnectionPool::new("ollama", factory.clone(), config);

        let conns = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        for conn in conns {
            pool.release(conn);
        }

        assert_eq!(pool.evict_idle().await, 2);
        assert_eq!(pool.stats().available, 1);
        let disconnected: usize = factory.created().iter().map(|c| c.disconnect_calls()).sum();
        assert_eq!(disconnected, 2);
    }
}
