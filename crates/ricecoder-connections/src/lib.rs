//! Provider connection management for RiceCoder
#![forbid(unsafe_code)]

//!
//! Keeps bounded pools of live connections per LLM provider, drives the
//! connection state of the active provider with retry and backoff, probes
//! registered models for health in the background and persists model
//! configuration through a pluggable store.
//!
//! ```
//! use std::sync::Arc;
//! use ricecoder_connections::testing::MockConnectionFactory;
//! use ricecoder_connections::{ConnectionPoolManager, PoolConfig};
//!
//! tokio_test::block_on(async {
//!     let manager = ConnectionPoolManager::new(
//!         Arc::new(MockConnectionFactory::new()),
//!         PoolConfig::default(),
//!     );
//!
//!     let connection = manager.acquire("ollama").await.unwrap();
//!     assert!(manager.release("ollama", connection));
//!
//!     let stats = manager.get_stats("ollama").unwrap();
//!     assert_eq!((stats.available, stats.in_use, stats.waiting), (1, 0, 0));
//! });
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod health;
pub mod manager;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod store;
pub mod testing;

pub use config::{ConnectionsConfig, HandlerConfig, HealthCheckConfig, PoolConfig};
pub use error::{Error, ProviderError, Result};
pub use events::{EventEmitter, SubscriptionId};
pub use handler::{ConnectionHandler, ConnectionState, ConnectionStatus, HandlerEvent};
pub use health::{HealthCheckResult, HealthEvent, HealthMetrics, HealthMonitor};
pub use manager::{ConnectionPoolManager, PoolEvent, PoolMetrics, PoolStats};
pub use pool::{
    ConnectionHealth, ConnectionPool, PoolHealthReport, PoolSnapshot, PooledConnection,
};
pub use provider::{
    Connection, ConnectionContext, ConnectionFactory, ModelInfo, Provider, ProviderConfig,
    ProviderConnection, ProviderConnectionFactory,
};
pub use registry::{Model, ModelRegistry, ModelSpec, RegistryEvent};
pub use store::{
    ConfigStore, ConfigValidator, DefaultModelConfigValidator, InMemoryConfigStore,
    JsonFileConfigStore, ModelConfig, ValidationResult,
};
