//! Provider and connection capabilities
//!
//! Concrete backends (ollama, lmstudio, hosted APIs) live outside this crate
//! and plug in through the [`Provider`] and [`Connection`] traits. Pools create
//! connections through a [`ConnectionFactory`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, ProviderError, Result};

/// Connection settings declared by a provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Overrides the monitor's default probe interval
    pub health_check_interval_ms: Option<u64>,
    /// Backend-specific options passed through untouched
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    /// Declared probe interval; zero counts as undeclared
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Core trait that all providers must implement
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable key identifying the backend kind, e.g. "ollama"
    fn name(&self) -> &str;

    fn config(&self) -> ProviderConfig;

    async fn connect(&self, config: &ProviderConfig) -> std::result::Result<(), ProviderError>;

    async fn disconnect(&self) -> std::result::Result<(), ProviderError>;

    /// Check if the provider is reachable and serving
    async fn is_available(&self) -> std::result::Result<bool, ProviderError>;
}

/// Model metadata reported by a live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_window: Option<usize>,
}

/// What a connection needs to know about the provider it connects to
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub provider_name: String,
    pub config: ProviderConfig,
}

impl ConnectionContext {
    pub fn for_provider(provider: &dyn Provider) -> Self {
        Self {
            provider_name: provider.name().to_string(),
            config: provider.config(),
        }
    }
}

/// A single live session to one provider
///
/// Connections carry no identity of their own: pools track them by `Arc`
/// pointer identity.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self, context: &ConnectionContext) -> std::result::Result<(), ProviderError>;

    async fn disconnect(&self) -> std::result::Result<(), ProviderError>;

    async fn model_info(&self) -> std::result::Result<ModelInfo, ProviderError>;

    async fn is_available(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Creates connected connections for a provider key
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self, provider_key: &str) -> Result<Arc<dyn Connection>>;
}

/// Connection that delegates to its provider
pub struct ProviderConnection {
    provider: Arc<dyn Provider>,
}

impl ProviderConnection {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }
}

#[async_trait]
impl Connection for ProviderConnection {
    async fn connect(&self, context: &ConnectionContext) -> std::result::Result<(), ProviderError> {
        self.provider.connect(&context.config).await
    }

    async fn disconnect(&self) -> std::result::Result<(), ProviderError> {
        self.provider.disconnect().await
    }

    async fn model_info(&self) -> std::result::Result<ModelInfo, ProviderError> {
        let config = self.provider.config();
        let model = config.model.ok_or_else(|| {
            ProviderError::NotFound(format!("no model configured for {}", self.provider.name()))
        })?;
        let context_window = config
            .options
            .get("context_window")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        Ok(ModelInfo {
            id: model.clone(),
            name: model,
            provider: self.provider.name().to_string(),
            context_window,
        })
    }

    async fn is_available(&self) -> std::result::Result<bool, ProviderError> {
        self.provider.is_available().await
    }
}

/// Factory that opens [`ProviderConnection`]s for registered providers
#[derive(Default)]
pub struct ProviderConnectionFactory {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its own name, replacing any previous one
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let key = provider.name().to_string();
        debug!("Registering provider for pooled connections: {}", key);
        self.providers.write().insert(key, provider);
    }

    pub fn unregister(&self, provider_key: &str) -> Option<Arc<dyn Provider>> {
        self.providers.write().remove(provider_key)
    }

    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(provider_key).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for ProviderConnectionFactory {
    async fn create_connection(&self, provider_key: &str) -> Result<Arc<dyn Connection>> {
        let provider = self.get(provider_key).ok_or(Error::ProviderNotFound)?;
        let context = ConnectionContext::for_provider(provider.as_ref());

        let connection = ProviderConnection::new(provider);
        connection.connect(&context).await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[tokio::test]
    async fn test_factory_connects_through_provider() {
        let provider = Arc::new(MockProvider::new("ollama"));
        let factory = ProviderConnectionFactory::new();
        factory.register(provider.clone());

        let connection = factory.create_connection("ollama").await.unwrap();
        assert_eq!(provider.connect_calls(), 1);

        connection.disconnect().await.unwrap();
        assert_eq!(provider.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_factory_unknown_provider() {
        let factory = ProviderConnectionFactory::new();
        let result = factory.create_connection("lmstudio").await;
        assert!(matches!(result, Err(Error::ProviderNotFound)));
    }

    #[tokio::test]
    async fn test_connect_error_surfaces_unchanged() {
        let provider = Arc::new(MockProvider::new("ollama"));
        provider.fail_connects(ProviderError::NetworkError("refused".to_string()));
        let factory = ProviderConnectionFactory::new();
        factory.register(provider);

        let result = factory.create_connection("ollama").await;
        assert_eq!(
            result.err(),
            Some(Error::Provider(ProviderError::NetworkError(
                "refused".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_model_info_from_config() {
        let provider = Arc::new(MockProvider::new("ollama").with_model("llama3"));
        let connection = ProviderConnection::new(provider);

        let info = connection.model_info().await.unwrap();
        assert_eq!(info.id, "llama3");
        assert_eq!(info.provider, "ollama");
    }
}
