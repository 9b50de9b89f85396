mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ricecoder_connections::testing::MockProvider;
use ricecoder_connections::{
    ConfigStore, ConnectionHandler, ConnectionPoolManager, ConnectionState, ConnectionsConfig,
    Error, HealthMonitor, JsonFileConfigStore, ModelRegistry, ModelSpec,
    ProviderConnectionFactory, ProviderError, RegistryEvent,
};
use serde_json::json;
use tempfile::TempDir;

const CONFIG: &str = r#"
pool:
  max_size: 2
  acquire_timeout_ms: 500
handler:
  max_retries: 2
  initial_retry_delay_ms: 100
health:
  interval_ms: 1000
  timeout_ms: 200
"#;

struct Harness {
    _dir: TempDir,
    store: Arc<JsonFileConfigStore>,
    monitor: Arc<HealthMonitor>,
    registry: ModelRegistry,
    manager: Arc<ConnectionPoolManager>,
    handler: ConnectionHandler,
    provider: Arc<MockProvider>,
}

fn harness() -> Harness {
    common::init_tracing();
    let config = ConnectionsConfig::from_yaml_str(CONFIG).unwrap();
    config.validate().unwrap();

    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileConfigStore::with_default_validator(dir.path()));
    let monitor = Arc::new(HealthMonitor::new(config.health.clone()));
    let registry = ModelRegistry::new(Arc::clone(&monitor), store.clone());

    let provider = Arc::new(
        MockProvider::new("ollama")
            .with_model("llama3")
            .with_health_check_interval(Duration::from_millis(100)),
    );
    let factory = Arc::new(ProviderConnectionFactory::new());
    factory.register(provider.clone());
    let manager = Arc::new(ConnectionPoolManager::new(factory, config.pool.clone()));
    let handler = ConnectionHandler::new(config.handler.clone());

    Harness {
        _dir: dir,
        store,
        monitor,
        registry,
        manager,
        handler,
        provider,
    }
}

#[tokio::test(start_paused = true)]
async fn test_model_lifecycle() {
    let h = harness();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.registry.subscribe(move |event| sink.lock().push(event.clone()));

    h.registry
        .register_model(ModelSpec::new("llama3", h.provider.clone()))
        .unwrap();

    let connection = h.manager.acquire("ollama").await.unwrap();
    h.handler.set_active_provider(h.provider.clone());
    h.handler.connect(Arc::clone(&connection)).await.unwrap();

    let status = h.handler.get_connection_status().await;
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.provider_name.as_deref(), Some("ollama"));
    assert_eq!(status.model_info.unwrap().id, "llama3");

    tokio::time::sleep(Duration::from_millis(350)).await;
    let health = h.registry.model_health("llama3").unwrap();
    assert_eq!(health.checks_performed, 3);
    assert_eq!(health.successful_checks, 3);

    let config = h
        .registry
        .update_model_config("llama3", json!({ "temperature": 0.1 }).as_object().unwrap().clone())
        .await
        .unwrap();
    let reopened = JsonFileConfigStore::with_default_validator(h.store.dir());
    assert_eq!(
        reopened.load_model_config("llama3").await.unwrap(),
        Some(config)
    );

    h.handler.disconnect().await;
    assert_eq!(h.handler.state(), ConnectionState::Disconnected);
    assert!(h.manager.release("ollama", connection));

    h.registry.unregister_model("llama3").await.unwrap();
    let probes = h.provider.availability_calls();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.provider.availability_calls(), probes);
    assert!(!h.monitor.is_monitoring("llama3"));

    let names: Vec<&'static str> = events
        .lock()
        .iter()
        .map(|event| match event {
            RegistryEvent::ModelRegistered { .. } => "registered",
            RegistryEvent::ModelUnregistered { .. } => "unregistered",
            RegistryEvent::ModelConfigChanged { .. } => "config_changed",
            RegistryEvent::ModelError { .. } => "error",
        })
        .collect();
    assert_eq!(names, vec!["registered", "config_changed", "unregistered"]);

    h.manager.dispose().await;
    h.handler.dispose().await;
    h.registry.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_outage_reported_and_recovered() {
    let h = harness();
    let errors = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&errors);
    h.registry.subscribe(move |event| {
        if let RegistryEvent::ModelError { model_id, .. } = event {
            assert_eq!(model_id, "llama3");
            *sink.lock() += 1;
        }
    });

    h.provider.script_availability([
        Ok(true),
        Err(ProviderError::NetworkError("connection refused".to_string())),
        Ok(false),
    ]);
    h.registry
        .register_model(ModelSpec::new("llama3", h.provider.clone()))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;

    let health = h.registry.model_health("llama3").unwrap();
    assert_eq!(health.checks_performed, 4);
    assert_eq!(health.failed_checks, 2);
    assert_eq!(*errors.lock(), 2);

    // The pool layer reports connect failures without retrying
    h.provider.fail_connects(ProviderError::Unavailable("loading model".to_string()));
    assert_eq!(
        h.manager.acquire("ollama").await.unwrap_err(),
        Error::Provider(ProviderError::Unavailable("loading model".to_string()))
    );

    h.provider.succeed_connects();
    let connection = h.manager.acquire("ollama").await.unwrap();
    h.handler.set_active_provider(h.provider.clone());
    h.handler.connect(connection).await.unwrap();
    assert_eq!(h.handler.state(), ConnectionState::Connected);

    h.registry.dispose().await;
    assert_eq!(h.provider.disconnect_calls(), 1);
}
