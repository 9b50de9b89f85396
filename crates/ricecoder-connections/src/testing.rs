//! In-memory providers and connections for tests
//!
//! These mocks record every call and can be scripted to fail, so callers can
//! exercise pools, handlers and monitors without a real backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ProviderError, Result};
use crate::provider::{
    Connection, ConnectionContext, ConnectionFactory, ModelInfo, Provider, ProviderConfig,
};

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Scriptable [`Provider`]
pub struct MockProvider {
    name: String,
    config: Mutex<ProviderConfig>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    availability_calls: AtomicUsize,
    connect_error: Mutex<Option<ProviderError>>,
    disconnect_error: Mutex<Option<ProviderError>>,
    available: Mutex<ProviderResult<bool>>,
    scripted_availability: Mutex<VecDeque<ProviderResult<bool>>>,
    probe_delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Mutex::new(ProviderConfig::default()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            availability_calls: AtomicUsize::new(0),
            connect_error: Mutex::new(None),
            disconnect_error: Mutex::new(None),
            available: Mutex::new(Ok(true)),
            scripted_availability: Mutex::new(VecDeque::new()),
            probe_delay: Mutex::new(None),
        }
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        self.config.lock().model = Some(model.into());
        self
    }

    pub fn with_health_check_interval(self, interval: Duration) -> Self {
        self.config.lock().health_check_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Every following `connect` fails with `error`
    pub fn fail_connects(&self, error: ProviderError) {
        *self.connect_error.lock() = Some(error);
    }

    pub fn succeed_connects(&self) {
        *self.connect_error.lock() = None;
    }

    pub fn fail_disconnects(&self, error: ProviderError) {
        *self.disconnect_error.lock() = Some(error);
    }

    /// Result returned by `is_available` once the script is exhausted
    pub fn set_availability(&self, result: ProviderResult<bool>) {
        *self.available.lock() = result;
    }

    /// Queues results consumed by the next `is_available` calls
    pub fn script_availability(&self, results: impl IntoIterator<Item = ProviderResult<bool>>) {
        self.scripted_availability.lock().extend(results);
    }

    /// Makes every probe take `delay` before answering
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = Some(delay);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn availability_calls(&self) -> usize {
        self.availability_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ProviderConfig {
        self.config.lock().clone()
    }

    async fn connect(&self, _config: &ProviderConfig) -> ProviderResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        match self.connect_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> ProviderResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        match self.disconnect_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn is_available(&self) -> ProviderResult<bool> {
        self.availability_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripted_availability.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self.available.lock().clone(),
        }
    }
}

/// Scriptable [`Connection`]
pub struct MockConnection {
    id: usize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    connect_failures: Mutex<VecDeque<ProviderError>>,
    disconnect_error: Mutex<Option<ProviderError>>,
    available: Mutex<ProviderResult<bool>>,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockConnection {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            connect_failures: Mutex::new(VecDeque::new()),
            disconnect_error: Mutex::new(None),
            available: Mutex::new(Ok(true)),
            connect_delay: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The next `count` connect attempts fail with `error`
    pub fn fail_next_connects(&self, count: usize, error: ProviderError) {
        let mut failures = self.connect_failures.lock();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    pub fn fail_disconnects(&self, error: ProviderError) {
        *self.disconnect_error.lock() = Some(error);
    }

    pub fn set_availability(&self, result: ProviderResult<bool>) {
        *self.available.lock() = result;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&self, _context: &ConnectionContext) -> ProviderResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.connect_failures.lock().pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> ProviderResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        match self.disconnect_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn model_info(&self) -> ProviderResult<ModelInfo> {
        Ok(ModelInfo {
            id: format!("mock-model-{}", self.id),
            name: "Mock Model".to_string(),
            provider: "mock".to_string(),
            context_window: Some(4096),
        })
    }

    async fn is_available(&self) -> ProviderResult<bool> {
        self.available.lock().clone()
    }
}

/// Factory producing [`MockConnection`]s and keeping every one it created
#[derive(Default)]
pub struct MockConnectionFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
    failures: Mutex<VecDeque<ProviderError>>,
    create_delay: Mutex<Option<Duration>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` creations fail with `error`
    pub fn fail_next(&self, count: usize, error: ProviderError) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create_connection(&self, _provider_key: &str) -> Result<Arc<dyn Connection>> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error.into());
        }

        let mut created = self.created.lock();
        let connection = Arc::new(MockConnection::new(created.len() + 1));
        created.push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// Returns true when `connection` is the same object as `mock`
pub fn is_same_connection(connection: &Arc<dyn Connection>, mock: &Arc<MockConnection>) -> bool {
    let mock: Arc<dyn Connection> = mock.clone();
    Arc::ptr_eq(connection, &mock)
}
