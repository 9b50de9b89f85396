//! Connection lifecycle for the application's active provider
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --disconnect--> Disconnected
//!                           Connecting --fail--> Error --connect--> Connecting
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HandlerConfig;
use crate::error::{Error, ProviderError, Result};
use crate::events::{EventEmitter, SubscriptionId};
use crate::provider::{Connection, ConnectionContext, ModelInfo, Provider};

/// Connection state of the active provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot returned by [`ConnectionHandler::get_connection_status`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub provider_name: Option<String>,
    /// Only present while connected
    pub model_info: Option<ModelInfo>,
    pub error: Option<Error>,
}

/// Notifications emitted by the handler
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    ProviderChanged {
        provider_name: String,
    },
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Disconnected,
    Error(Error),
    /// Sent after every state transition
    StatusChanged(ConnectionStatus),
}

struct HandlerState {
    state: ConnectionState,
    provider: Option<Arc<dyn Provider>>,
    connection: Option<Arc<dyn Connection>>,
    last_error: Option<Error>,
}

impl HandlerState {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            provider_name: self.provider.as_ref().map(|p| p.name().to_string()),
            model_info: None,
            error: self.last_error.clone(),
        }
    }
}

/// Drives the connection of the single active provider
pub struct ConnectionHandler {
    config: HandlerConfig,
    state: Mutex<HandlerState>,
    events: EventEmitter<HandlerEvent>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HandlerState {
                state: ConnectionState::Disconnected,
                provider: None,
                connection: None,
                last_error: None,
            }),
            events: EventEmitter::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the retry and timeout settings
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Returns the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Returns the provider set by [`ConnectionHandler::set_active_provider`]
    pub fn active_provider(&self) -> Option<Arc<dyn Provider>> {
        self.state.lock().provider.clone()
    }

    /// Returns the error that put the handler into `Error`, if any
    pub fn last_error(&self) -> Option<Error> {
        self.state.lock().last_error.clone()
    }

    /// Replaces the active provider without connecting to it
    pub fn set_active_provider(&self, provider: Arc<dyn Provider>) {
        let provider_name = provider.name().to_string();
        self.state.lock().provider = Some(provider);
        info!("Active provider set to '{}'", provider_name);
        self.events
            .emit(&HandlerEvent::ProviderChanged { provider_name });
    }

    fn transition(&self, next: ConnectionState, last_error: Option<Error>) {
        let (previous, status) = {
            let mut state = self.state.lock();
            let previous = state.state;
            state.state = next;
            state.last_error = last_error;
            (previous, state.status())
        };
        self.announce(previous, status);
    }

    fn announce(&self, previous: ConnectionState, status: ConnectionStatus) {
        let next = status.state;
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
            self.events.emit(&HandlerEvent::StateChanged {
                previous,
                current: next,
            });
        }
        self.events.emit(&HandlerEvent::StatusChanged(status));
    }

    /// Connects `connection` to the active provider
    ///
    /// With `reconnect_on_error`, failed attempts are retried up to
    /// `max_retries` times, waiting `min(initial * 2^attempt, max)` between
    /// attempts.
    ///
    /// # Errors
    /// `ProviderNotFound` without an active provider, `InvalidState` while
    /// another attempt is running, `RetryCancelled` if the handler is disposed
    /// during an attempt or a backoff, or the last provider error.
    ///
    /// Dropping the returned future mid-attempt leaves the handler in `Error`.
    pub async fn connect(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let (provider, replaced, previous_state, status) = {
            let mut state = self.state.lock();
            let provider = state.provider.clone().ok_or(Error::ProviderNotFound)?;
            if state.state == ConnectionState::Connecting {
                return Err(Error::InvalidState(
                    "a connection attempt is already in progress".to_string(),
                ));
            }
            if self.cancel.is_cancelled() {
                return Err(Error::InvalidState("handler has been disposed".to_string()));
            }
            let previous_state = state.state;
            state.state = ConnectionState::Connecting;
            state.last_error = None;
            (provider, state.connection.take(), previous_state, state.status())
        };
        self.announce(previous_state, status);
        let mut attempt_guard = AttemptGuard {
            handler: self,
            armed: true,
        };

        if let Some(replaced) = replaced {
            if !Arc::ptr_eq(&replaced, &connection) {
                if let Err(e) = replaced.disconnect().await {
                    warn!("Ignoring error while replacing connection: {}", e);
                }
            }
        }

        let context = ConnectionContext::for_provider(provider.as_ref());
        let timeout = self.config.connection_timeout();
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = tokio::time::timeout(timeout, connection.connect(&context)) => Some(outcome),
            };
            let result = match outcome {
                None => {
                    attempt_guard.disarm();
                    return self.abort_attempt(&connection).await;
                }
                Some(Ok(Ok(()))) => Ok(()),
                Some(Ok(Err(e))) => Err(Error::Provider(e)),
                Some(Err(_)) => Err(Error::Provider(ProviderError::Timeout(
                    self.config.connection_timeout_ms,
                ))),
            };

            let failure = match result {
                Ok(()) => {
                    attempt_guard.disarm();
                    let committed = {
                        let mut state = self.state.lock();
                        if self.cancel.is_cancelled() {
                            None
                        } else {
                            let previous = state.state;
                            state.state = ConnectionState::Connected;
                            state.last_error = None;
                            state.connection = Some(Arc::clone(&connection));
                            Some((previous, state.status()))
                        }
                    };
                    let Some((previous, status)) = committed else {
                        return self.abort_attempt(&connection).await;
                    };
                    self.announce(previous, status);
                    info!("Connected to provider '{}'", context.provider_name);
                    return Ok(());
                }
                Err(e) => e,
            };

            if self.config.reconnect_on_error && attempt < self.config.max_retries {
                let delay = self.config.retry_delay(attempt);
                attempt += 1;
                warn!(
                    "Connection attempt {} to '{}' failed: {}. Retrying in {:?}",
                    attempt, context.provider_name, failure, delay
                );

                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        attempt_guard.disarm();
                        self.transition(ConnectionState::Error, Some(failure));
                        return Err(Error::RetryCancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            error!(
                "Failed to connect to '{}' after {} attempts: {}",
                context.provider_name,
                attempt + 1,
                failure
            );
            attempt_guard.disarm();
            self.transition(ConnectionState::Error, Some(failure.clone()));
            self.events.emit(&HandlerEvent::Error(failure.clone()));
            return Err(failure);
        }
    }

    /// Closes a connection whose attempt was interrupted by `dispose`
    async fn abort_attempt(&self, connection: &Arc<dyn Connection>) -> Result<()> {
        self.transition(ConnectionState::Error, Some(Error::RetryCancelled));
        debug!("Connection attempt cancelled by dispose");
        if let Err(e) = connection.disconnect().await {
            warn!("Ignoring disconnect error after cancelled attempt: {}", e);
        }
        Err(Error::RetryCancelled)
    }

    /// Disconnects the current connection
    ///
    /// Always ends `Disconnected` and emits `Disconnected`, even when the
    /// connection reports an error while closing.
    pub async fn disconnect(&self) {
        let connection = self.state.lock().connection.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                warn!("Ignoring disconnect error: {}", e);
            }
        }

        self.transition(ConnectionState::Disconnected, None);
        self.events.emit(&HandlerEvent::Disconnected);
        info!("Disconnected from active provider");
    }

    /// Current state, provider, and model info (fetched only while connected)
    pub async fn get_connection_status(&self) -> ConnectionStatus {
        let (mut status, connection) = {
            let state = self.state.lock();
            (state.status(), state.connection.clone())
        };

        if status.state == ConnectionState::Connected {
            if let Some(connection) = connection {
                match connection.model_info().await {
                    Ok(info) => status.model_info = Some(info),
                    Err(e) => debug!("Model info unavailable: {}", e),
                }
            }
        }
        status
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HandlerEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Cancels any pending retry, disconnects if connected, and drops all
    /// subscriptions
    pub async fn dispose(&self) {
        self.cancel.cancel();
        if self.state() == ConnectionState::Connected {
            self.disconnect().await;
        }
        self.events.clear();
        debug!("Connection handler disposed");
    }
}

/// Moves an attempt abandoned by its caller out of `Connecting`
struct AttemptGuard<'a> {
    handler: &'a ConnectionHandler,
    armed: bool,
}

impl AttemptGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || self.handler.state() != ConnectionState::Connecting {
            return;
        }
        warn!("Connection attempt dropped before completing");
        self.handler
            .transition(ConnectionState::Error, Some(Error::RetryCancelled));
    }
}

impl Default for ConnectionHandler {
    fn default() -> Self {
        Self::new(HandlerConfig::default())
    }
}
