//! Periodic health probes for registered models
//!
//! Each monitored model gets its own background task that sleeps for the
//! probe interval, calls the provider's `is_available`, records the outcome
//! and emits a notification. The next sleep starts only after the probe has
//! settled, so probes for one model never overlap. A failed probe never stops
//! the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::error::{Error, ProviderError};
use crate::events::{EventEmitter, SubscriptionId};
use crate::provider::Provider;

/// Accumulated probe statistics for one model
///
/// Reset only when monitoring for the model restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub checks_performed: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub average_latency: Duration,
    pub last_check_timestamp: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.checks_performed == 0 {
            return 0.0;
        }
        self.successful_checks as f64 / self.checks_performed as f64
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub model_id: String,
    pub is_healthy: bool,
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Notifications emitted by the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    ModelHealthy {
        model_id: String,
        result: HealthCheckResult,
    },
    ModelUnhealthy {
        model_id: String,
        error: Error,
    },
    /// Sent alongside every `ModelUnhealthy`
    Error {
        model_id: String,
        error: Error,
    },
}

struct MetricsEntry {
    generation: u64,
    metrics: HealthMetrics,
}

struct MonitorShared {
    metrics: Mutex<HashMap<String, MetricsEntry>>,
    events: EventEmitter<HealthEvent>,
}

impl MonitorShared {
    fn record(
        &self,
        model_id: &str,
        generation: u64,
        outcome: Result<(), Error>,
        latency: Duration,
    ) {
        let checked_at = Utc::now();
        {
            let mut metrics = self.metrics.lock();
            let Some(entry) = metrics.get_mut(model_id) else {
                return;
            };
            // A newer monitor for the same id owns these metrics
            if entry.generation != generation {
                return;
            }

            let m = &mut entry.metrics;
            m.checks_performed += 1;
            m.last_check_timestamp = Some(checked_at);
            if outcome.is_ok() {
                m.successful_checks += 1;
            } else {
                m.failed_checks += 1;
            }
            let n = u128::from(m.checks_performed);
            let mean = (m.average_latency.as_nanos() * (n - 1) + latency.as_nanos()) / n;
            m.average_latency = Duration::from_nanos(mean.min(u128::from(u64::MAX)) as u64);
        }

        match outcome {
            Ok(()) => {
                debug!("Health check passed for model '{}' in {:?}", model_id, latency);
                self.events.emit(&HealthEvent::ModelHealthy {
                    model_id: model_id.to_string(),
                    result: HealthCheckResult {
                        model_id: model_id.to_string(),
                        is_healthy: true,
                        latency,
                        checked_at,
                        error: None,
                    },
                });
            }
            Err(error) => {
                warn!("Health check failed for model '{}': {}", model_id, error);
                self.events.emit(&HealthEvent::ModelUnhealthy {
                    model_id: model_id.to_string(),
                    error: error.clone(),
                });
                self.events.emit(&HealthEvent::Error {
                    model_id: model_id.to_string(),
                    error,
                });
            }
        }
    }
}

struct ProbeTask {
    model_id: String,
    generation: u64,
    provider: Arc<dyn Provider>,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
    shared: Arc<MonitorShared>,
}

impl ProbeTask {
    async fn run(self) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            // The timer may have fired in the same instant as a cancellation
            if self.token.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.timeout, self.provider.is_available()).await {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err(Error::Provider(ProviderError::Unavailable(format!(
                    "{} reported unavailable",
                    self.provider.name()
                )))),
                Ok(Err(e)) => Err(Error::Provider(e)),
                Err(_) => Err(Error::Provider(ProviderError::Timeout(
                    self.timeout.as_millis() as u64,
                ))),
            };
            let latency = started.elapsed();

            if self.token.is_cancelled() {
                break;
            }
            self.shared
                .record(&self.model_id, self.generation, outcome, latency);
        }
        debug!("Health monitoring loop ended for model '{}'", self.model_id);
    }
}

/// Runs periodic availability probes for models
pub struct HealthMonitor {
    config: HealthCheckConfig,
    shared: Arc<MonitorShared>,
    monitors: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
    next_generation: AtomicU64,
}

impl HealthMonitor {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            shared: Arc::new(MonitorShared {
                metrics: Mutex::new(HashMap::new()),
                events: EventEmitter::new(),
            }),
            monitors: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Starts probing `provider` on behalf of `model_id`
    ///
    /// Uses the provider's declared interval, falling back to the configured
    /// default when none or zero is declared. Must be called from within a Tokio runtime.
    ///
    /// # Returns
    /// False if the model is already monitored or the monitor is disposed
    pub fn start_monitoring(&self, model_id: &str, provider: Arc<dyn Provider>) -> bool {
        let interval = provider
            .config()
            .health_check_interval()
            .unwrap_or_else(|| self.config.interval());

        let task = {
            let mut monitors = self.monitors.lock();
            if self.root.is_cancelled() {
                warn!("Ignoring start_monitoring for '{}' after dispose", model_id);
                return false;
            }
            if monitors.contains_key(model_id) {
                debug!("Model '{}' is already monitored", model_id);
                return false;
            }

            let token = self.root.child_token();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            monitors.insert(model_id.to_string(), token.clone());
            self.shared.metrics.lock().insert(
                model_id.to_string(),
                MetricsEntry {
                    generation,
                    metrics: HealthMetrics::default(),
                },
            );

            ProbeTask {
                model_id: model_id.to_string(),
                generation,
                provider,
                interval,
                timeout: self.config.timeout(),
                token,
                shared: Arc::clone(&self.shared),
            }
        };

        info!(
            "Started health monitoring for model '{}' every {:?}",
            model_id, interval
        );
        tokio::spawn(task.run());
        true
    }

    /// Stops probing `model_id` and drops its metrics
    ///
    /// # Returns
    /// False if the model was not monitored
    pub fn stop_monitoring(&self, model_id: &str) -> bool {
        let Some(token) = self.monitors.lock().remove(model_id) else {
            return false;
        };
        token.cancel();
        self.shared.metrics.lock().remove(model_id);
        info!("Stopped health monitoring for model '{}'", model_id);
        true
    }

    pub fn is_monitoring(&self, model_id: &str) -> bool {
        self.monitors.lock().contains_key(model_id)
    }

    pub fn monitored_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.monitors.lock().keys().cloned().collect();
        models.sort();
        models
    }

    pub fn get_metrics(&self, model_id: &str) -> Option<HealthMetrics> {
        self.shared
            .metrics
            .lock()
            .get(model_id)
            .map(|entry| entry.metrics.clone())
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HealthEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Stops every monitor and drops all subscriptions
    ///
    /// No probe runs after this returns, including one whose timer has
    /// already elapsed.
    pub fn dispose(&self) {
        self.root.cancel();
        let stopped = {
            let mut monitors = self.monitors.lock();
            let count = monitors.len();
            monitors.clear();
            count
        };
        self.shared.metrics.lock().clear();
        self.shared.events.clear();
        info!("Health monitor disposed ({} monitors stopped)", stopped);
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
