//! Persistence of model configuration
//!
//! The registry persists every configuration change through a [`ConfigStore`].
//! Stores validate what they are given with an injected [`ConfigValidator`]
//! and refuse invalid configurations with [`Error::ValidationFailed`].

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Persisted configuration of one named model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Outcome of validating a [`ModelConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// Converts a failed validation into [`Error::ValidationFailed`]
    pub fn into_result(self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(Error::ValidationFailed(self.errors))
        }
    }
}

pub trait ConfigValidator: Send + Sync {
    fn validate(&self, config: &ModelConfig) -> ValidationResult;
}

/// Checks the fields every backend understands
///
/// Unknown parameters are accepted untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultModelConfigValidator;

impl DefaultModelConfigValidator {
    fn check_range(
        parameters: &Map<String, Value>,
        key: &str,
        min: f64,
        max: f64,
        errors: &mut Vec<String>,
    ) {
        match parameters.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => match n.as_f64() {
                Some(v) if (min..=max).contains(&v) => {}
                _ => errors.push(format!("{} must be between {} and {}", key, min, max)),
            },
            Some(_) => errors.push(format!("{} must be a number", key)),
        }
    }
}

impl ConfigValidator for DefaultModelConfigValidator {
    fn validate(&self, config: &ModelConfig) -> ValidationResult {
        let mut errors = Vec::new();

        if config.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if config.provider.trim().is_empty() {
            errors.push("provider must not be empty".to_string());
        }

        Self::check_range(&config.parameters, "temperature", 0.0, 2.0, &mut errors);
        Self::check_range(&config.parameters, "top_p", 0.0, 1.0, &mut errors);

        match config.parameters.get("max_tokens") {
            None | Some(Value::Null) => {}
            Some(value) => match value.as_u64() {
                Some(n) if n > 0 => {}
                _ => errors.push("max_tokens must be a positive integer".to_string()),
            },
        }

        ValidationResult::from_errors(errors)
    }
}

/// Storage backend for model configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Validates and persists `config` under `model_id`, replacing any previous value
    async fn save_model_config(&self, model_id: &str, config: &ModelConfig) -> Result<()>;

    async fn load_model_config(&self, model_id: &str) -> Result<Option<ModelConfig>>;

    /// All stored configurations, keyed by model id
    async fn list_model_configs(&self) -> Result<BTreeMap<String, ModelConfig>>;
}

/// Process-local store, mostly useful for tests and ephemeral sessions
pub struct InMemoryConfigStore {
    configs: RwLock<HashMap<String, ModelConfig>>,
    validator: Arc<dyn ConfigValidator>,
}

impl InMemoryConfigStore {
    pub fn new(validator: Arc<dyn ConfigValidator>) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            validator,
        }
    }
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self::new(Arc::new(DefaultModelConfigValidator))
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn save_model_config(&self, model_id: &str, config: &ModelConfig) -> Result<()> {
        self.validator.validate(config).into_result()?;
        self.configs
            .write()
            .insert(model_id.to_string(), config.clone());
        Ok(())
    }

    async fn load_model_config(&self, model_id: &str) -> Result<Option<ModelConfig>> {
        Ok(self.configs.read().get(model_id).cloned())
    }

    async fn list_model_configs(&self) -> Result<BTreeMap<String, ModelConfig>> {
        Ok(self
            .configs
            .read()
            .iter()
            .map(|(id, config)| (id.clone(), config.clone()))
            .collect())
    }
}

/// Stores each model as `<model_id>.json` inside one directory
pub struct JsonFileConfigStore {
    dir: PathBuf,
    validator: Arc<dyn ConfigValidator>,
}

impl JsonFileConfigStore {
    pub fn new(dir: impl Into<PathBuf>, validator: Arc<dyn ConfigValidator>) -> Self {
        Self {
            dir: dir.into(),
            validator,
        }
    }

    pub fn with_default_validator(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, Arc::new(DefaultModelConfigValidator))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, model_id: &str) -> Result<PathBuf> {
        let valid = !model_id.is_empty()
            && !model_id.starts_with('.')
            && model_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !valid {
            return Err(Error::ConfigError(format!(
                "Invalid model id for file storage: '{}'",
                model_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", model_id)))
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn save_model_config(&self, model_id: &str, config: &ModelConfig) -> Result<()> {
        self.validator.validate(config).into_result()?;
        let path = self.path_for(model_id)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(config)?;

        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved model config '{}' to {}", model_id, path.display());
        Ok(())
    }

    async fn load_model_config(&self, model_id: &str) -> Result<Option<ModelConfig>> {
        let path = self.path_for(model_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_model_configs(&self) -> Result<BTreeMap<String, ModelConfig>> {
        let mut configs = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(configs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(model_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<ModelConfig>(&content) {
                Ok(config) => {
                    configs.insert(model_id.to_string(), config);
                }
                Err(e) => warn!("Skipping unreadable model config {}: {}", path.display(), e),
            }
        }

        Ok(configs)
    }
}
