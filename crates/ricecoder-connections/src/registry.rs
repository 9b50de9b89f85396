//! Named catalogue of models
//!
//! Every registered model is wired into the [`HealthMonitor`] for its whole
//! lifetime. Configuration changes are persisted through a [`ConfigStore`]
//! before they become visible.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventEmitter, SubscriptionId};
use crate::health::{HealthEvent, HealthMetrics, HealthMonitor};
use crate::provider::Provider;
use crate::store::{ConfigStore, ModelConfig};

/// Input to [`ModelRegistry::register_model`]
pub struct ModelSpec {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub parameters: Map<String, Value>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            name: name.into(),
            provider,
            parameters: Map::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A registered model
#[derive(Clone)]
pub struct Model {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub parameters: Map<String, Value>,
}

impl Model {
    pub fn config(&self) -> ModelConfig {
        ModelConfig {
            name: self.name.clone(),
            provider: self.provider.name().to_string(),
            parameters: self.parameters.clone(),
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Notifications emitted by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    ModelRegistered { name: String },
    ModelUnregistered { name: String },
    ModelConfigChanged { name: String, config: ModelConfig },
    /// A health probe for the model failed
    ModelError { model_id: String, error: Error },
}

pub struct ModelRegistry {
    models: RwLock<HashMap<String, Model>>,
    monitor: Arc<HealthMonitor>,
    store: Arc<dyn ConfigStore>,
    events: Arc<EventEmitter<RegistryEvent>>,
    health_subscription: SubscriptionId,
    // Serializes read-merge-persist cycles so concurrent updates never lose keys
    update_lock: tokio::sync::Mutex<()>,
}

impl ModelRegistry {
    pub fn new(monitor: Arc<HealthMonitor>, store: Arc<dyn ConfigStore>) -> Self {
        let events = Arc::new(EventEmitter::new());
        let forward = Arc::clone(&events);
        let health_subscription = monitor.subscribe(move |event| {
            if let HealthEvent::ModelUnhealthy { model_id, error } = event {
                forward.emit(&RegistryEvent::ModelError {
                    model_id: model_id.clone(),
                    error: error.clone(),
                });
            }
        });

        Self {
            models: RwLock::new(HashMap::new()),
            monitor,
            store,
            events,
            health_subscription,
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Adds a model and starts monitoring its provider
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `AlreadyRegistered` for a taken name, `InvalidState` if the health
    /// monitor refuses the model (disposed, or already probing that name)
    pub fn register_model(&self, spec: ModelSpec) -> Result<()> {
        let provider = {
            let mut models = self.models.write();
            if models.contains_key(&spec.name) {
                return Err(Error::AlreadyRegistered(spec.name));
            }
            let provider = Arc::clone(&spec.provider);
            models.insert(
                spec.name.clone(),
                Model {
                    name: spec.name.clone(),
                    provider: spec.provider,
                    parameters: spec.parameters,
                },
            );
            provider
        };

        if !self.monitor.start_monitoring(&spec.name, provider) {
            self.models.write().remove(&spec.name);
            warn!("Health monitor refused model '{}'", spec.name);
            return Err(Error::InvalidState(format!(
                "health monitoring unavailable for model '{}'",
                spec.name
            )));
        }
        info!("Registered model '{}'", spec.name);
        self.events
            .emit(&RegistryEvent::ModelRegistered { name: spec.name });
        Ok(())
    }

    pub fn get_model(&self, name: &str) -> Option<Model> {
        self.models.read().get(name).cloned()
    }

    /// All models, sorted by name
    pub fn list_models(&self) -> Vec<Model> {
        let mut models: Vec<Model> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn model_config(&self, name: &str) -> Option<ModelConfig> {
        self.models.read().get(name).map(Model::config)
    }

    pub fn model_health(&self, name: &str) -> Option<HealthMetrics> {
        self.monitor.get_metrics(name)
    }

    /// Removes a model, stops its monitor and disconnects its provider
    ///
    /// Waits for any in-flight config update on the registry. A failing
    /// disconnect is logged and does not fail the call.
    pub async fn unregister_model(&self, name: &str) -> Result<()> {
        let _guard = self.update_lock.lock().await;

        let model = self
            .models
            .write()
            .remove(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;

        self.monitor.stop_monitoring(name);
        if let Err(e) = model.provider.disconnect().await {
            warn!(
                "Failed to disconnect provider '{}' for model '{}': {}",
                model.provider.name(),
                name,
                e
            );
        }

        info!("Unregistered model '{}'", name);
        self.events.emit(&RegistryEvent::ModelUnregistered {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Merges `partial` into the model's parameters and persists the result
    ///
    /// Top-level keys in `partial` replace existing ones wholesale. Nothing
    /// changes in memory if the store rejects the new configuration.
    pub async fn update_model_config(
        &self,
        name: &str,
        partial: Map<String, Value>,
    ) -> Result<ModelConfig> {
        let _guard = self.update_lock.lock().await;

        let mut model = self
            .get_model(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        for (key, value) in partial {
            model.parameters.insert(key, value);
        }
        let config = model.config();

        self.store.save_model_config(name, &config).await?;
        self.commit_parameters(name, &model.provider, model.parameters)?;

        debug!("Updated config for model '{}'", name);
        self.events.emit(&RegistryEvent::ModelConfigChanged {
            name: name.to_string(),
            config: config.clone(),
        });
        Ok(config)
    }

    /// Replaces the model's parameters with the persisted ones
    ///
    /// # Returns
    /// The applied configuration, or `None` if the store has nothing for
    /// this model
    pub async fn reload_model_config(&self, name: &str) -> Result<Option<ModelConfig>> {
        let _guard = self.update_lock.lock().await;

        let model = self
            .get_model(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        let Some(stored) = self.store.load_model_config(name).await? else {
            debug!("No stored config for model '{}'", name);
            return Ok(None);
        };

        if stored.provider != model.provider.name() {
            warn!(
                "Stored config for model '{}' names provider '{}', keeping '{}'",
                name,
                stored.provider,
                model.provider.name()
            );
        }
        self.commit_parameters(name, &model.provider, stored.parameters)?;

        let config = self
            .model_config(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        self.events.emit(&RegistryEvent::ModelConfigChanged {
            name: name.to_string(),
            config: config.clone(),
        });
        Ok(Some(config))
    }

    fn commit_parameters(
        &self,
        name: &str,
        provider: &Arc<dyn Provider>,
        parameters: Map<String, Value>,
    ) -> Result<()> {
        let mut models = self.models.write();
        match models.get_mut(name) {
            // Re-registered under the same name while the store was busy
            Some(model) if Arc::ptr_eq(&model.provider, provider) => {
                model.parameters = parameters;
                Ok(())
            }
            _ => Err(Error::ModelNotFound(name.to_string())),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Stops all monitoring, disconnects every provider and drops all subscriptions
    pub async fn dispose(&self) {
        self.monitor.unsubscribe(self.health_subscription);
        self.monitor.dispose();

        let models: Vec<Model> = self.models.write().drain().map(|(_, m)| m).collect();
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        for model in models {
            if !providers.iter().any(|p| Arc::ptr_eq(p, &model.provider)) {
                providers.push(model.provider);
            }
        }

        for provider in &providers {
            if let Err(e) = provider.disconnect().await {
                warn!("Failed to disconnect provider '{}': {}", provider.name(), e);
            }
        }

        self.events.clear();
        info!("Model registry disposed ({} providers disconnected)", providers.len());
    }
}
