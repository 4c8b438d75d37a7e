//! Supervisor loop
//!
//! Ties the source registry, the ingestion relay and the presence aggregator
//! together on a fixed tick.
//!
//! ## Tick
//!
//! 1. Load the configuration on the blocking pool and compare it with the
//!    running one
//! 2. On change, stop the old session (pollers + channels) and build a new one
//! 3. Connect the presence channels if they are not connected
//! 4. Merge polled tracks, then relayed tracks, and run the aggregator
//!
//! ## Failures
//!
//! Nothing here is fatal. An invalid configuration keeps the previous
//! session untouched and is retried after `timing.config_retry_ms`. Presence
//! channel faults pick a backoff per [`PresenceError`] variant; severed and
//! unreachable channels are closed so the next tick reconnects all of them.
//! Any other fault is logged and retried after
//! `timing.unexpected_error_backoff_ms`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{PresenceAggregator, Recovery, SlotOutcome};
use crate::config::{PresenceConfig, TimingConfig};
use crate::error::{Error, PresenceError, Result};
use crate::registry::{AdapterRegistry, SourceRegistry};
use crate::relay::RelayState;
use crate::traits::{ConfigLoader, PresenceChannelFactory};

/// Events emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Supervisor started
    Started,

    /// A new configuration was applied and the session rebuilt
    ConfigApplied { enabled_sources: Vec<String> },

    /// The configuration could not be loaded or failed validation
    ConfigRejected { reason: String },

    /// An activity was published
    Published {
        source: String,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    },

    /// A source had a candidate but nothing changed
    Skipped { source: String },

    /// A source's channel was cleared
    Cleared { source: String },

    /// A presence channel operation failed
    ChannelLost { kind: String },

    /// Supervisor stopped
    Stopped { reason: String },
}

/// Components built from one configuration value
struct Session {
    config: PresenceConfig,
    registry: SourceRegistry,
    aggregator: PresenceAggregator,
}

impl Session {
    fn start(
        config: PresenceConfig,
        adapters: &AdapterRegistry,
        channels: Arc<dyn PresenceChannelFactory>,
        cancel: &CancellationToken,
    ) -> Self {
        let registry = SourceRegistry::start(&config, adapters, cancel);
        let aggregator = PresenceAggregator::new(&config, channels);

        Self {
            config,
            registry,
            aggregator,
        }
    }

    async fn shutdown(mut self) {
        self.registry.stop().await;
        self.aggregator.close().await;
    }
}

/// Drives the presence pipeline until cancelled
///
/// ## Lifecycle
///
/// 1. Create with [`Supervisor::new()`]
/// 2. Optionally attach the relay with [`Supervisor::with_relay()`]
/// 3. Run with [`Supervisor::run()`] until the token is cancelled
pub struct Supervisor {
    loader: Arc<dyn ConfigLoader>,
    adapters: Arc<AdapterRegistry>,
    channels: Arc<dyn PresenceChannelFactory>,
    relay: Option<Arc<RelayState>>,
    config_tx: watch::Sender<PresenceConfig>,
    event_tx: mpsc::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Create a supervisor
    ///
    /// # Parameters
    ///
    /// - `loader`: configuration source, read once per tick
    /// - `adapters`: factories for polled sources
    /// - `channels`: factory for presence channels
    /// - `config_tx`: receives every applied configuration (the relay
    ///   subscribes to it); its current value sizes the event channel
    ///
    /// # Returns
    ///
    /// A tuple of (supervisor, event_receiver)
    pub fn new(
        loader: Arc<dyn ConfigLoader>,
        adapters: Arc<AdapterRegistry>,
        channels: Arc<dyn PresenceChannelFactory>,
        config_tx: watch::Sender<PresenceConfig>,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let capacity = config_tx.borrow().timing.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let supervisor = Self {
            loader,
            adapters,
            channels,
            relay: None,
            config_tx,
            event_tx,
        };

        (supervisor, event_rx)
    }

    /// Merge tracks pushed through the ingestion relay
    pub fn with_relay(mut self, relay: Arc<RelayState>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Run until `cancel` fires
    ///
    /// On return every poller has exited and every presence channel has been
    /// cleared and closed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Supervisor starting");
        self.emit_event(SupervisorEvent::Started);

        let mut session: Option<Session> = None;

        loop {
            let delay = match self.tick(&mut session, &cancel).await {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Unexpected supervisor fault: {}", e);
                    self.timing(&session).unexpected_error_backoff()
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Shutdown signal received");
        if let Some(session) = session.take() {
            session.shutdown().await;
        }

        self.emit_event(SupervisorEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        info!("Supervisor stopped");

        Ok(())
    }

    /// One pass of the loop; returns the delay before the next one
    async fn tick(
        &self,
        session: &mut Option<Session>,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let config = match self.load_config().await {
            Ok(config) => config,
            Err(e @ (Error::Config(_) | Error::Yaml(_))) => {
                warn!("Configuration rejected: {}", e);
                self.emit_event(SupervisorEvent::ConfigRejected {
                    reason: e.to_string(),
                });
                return Ok(self.timing(session).config_retry());
            }
            Err(e) => return Err(e),
        };

        let current = match session.take() {
            Some(running) if running.config == config => running,
            previous => {
                if let Some(previous) = previous {
                    info!("Configuration changed, rebuilding");
                    previous.shutdown().await;
                }
                self.apply(config, cancel)
            }
        };
        let current = session.insert(current);
        let timing = current.config.timing.clone();

        if !current.aggregator.is_connected()
            && let Err(e) = current.aggregator.connect().await
        {
            return Ok(self.recover(current, e, &timing).await);
        }

        let mut candidates = current.registry.get_current_tracks();
        if let Some(relay) = &self.relay {
            candidates.extend(relay.get_current_tracks().await);
        }

        let now_ms = Utc::now().timestamp_millis();
        match current.aggregator.update(&candidates, now_ms).await {
            Ok(outcomes) => {
                let mut failure = None;
                for outcome in outcomes {
                    match outcome {
                        SlotOutcome::Failed { error, .. } => {
                            failure.get_or_insert(error);
                        }
                        outcome => self.report(outcome),
                    }
                }
                match failure {
                    Some(e) => Ok(self.recover(current, e, &timing).await),
                    None => Ok(timing.tick_interval()),
                }
            }
            Err(e) => Ok(self.recover(current, e, &timing).await),
        }
    }

    /// Load and validate off the runtime threads; loaders read files
    async fn load_config(&self) -> Result<PresenceConfig> {
        let loader = self.loader.clone();
        let config = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| Error::Other(format!("configuration load task failed: {}", e)))??;
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: PresenceConfig, cancel: &CancellationToken) -> Session {
        let enabled_sources = config.enabled_sources();
        info!("Applying configuration (enabled sources: {:?})", enabled_sources);

        self.config_tx.send_replace(config.clone());
        let session = Session::start(config, &self.adapters, self.channels.clone(), cancel);

        self.emit_event(SupervisorEvent::ConfigApplied { enabled_sources });
        session
    }

    async fn recover(
        &self,
        session: &mut Session,
        err: PresenceError,
        timing: &TimingConfig,
    ) -> Duration {
        self.emit_event(SupervisorEvent::ChannelLost {
            kind: err.kind().to_string(),
        });

        let delay = match err {
            PresenceError::ChannelSevered => timing.severed_backoff(),
            PresenceError::HostUnreachable => timing.unreachable_backoff(),
            PresenceError::Channel(_) => timing.channel_error_backoff(),
        };

        match Recovery::from(&err) {
            Recovery::Reconnect => {
                warn!("Presence channel lost ({}), reconnecting in {:?}", err, delay);
                session.aggregator.close().await;
            }
            Recovery::Retry => {
                warn!("Presence update failed: {}, retrying in {:?}", err, delay);
            }
        }

        delay
    }

    fn report(&self, outcome: SlotOutcome) {
        let event = match outcome {
            SlotOutcome::Published { source, activity } => SupervisorEvent::Published {
                source: source.to_string(),
                start_ms: activity.start_ms,
                end_ms: activity.end_ms,
            },
            SlotOutcome::Skipped { source } => SupervisorEvent::Skipped {
                source: source.to_string(),
            },
            SlotOutcome::Cleared { source } => SupervisorEvent::Cleared {
                source: source.to_string(),
            },
            SlotOutcome::Idle { .. } | SlotOutcome::Failed { .. } => return,
        };

        self.emit_event(event);
    }

    fn timing(&self, session: &Option<Session>) -> TimingConfig {
        match session {
            Some(session) => session.config.timing.clone(),
            None => self.config_tx.borrow().timing.clone(),
        }
    }

    /// Emit an event to the channel
    fn emit_event(&self, event: SupervisorEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event channel full, dropping event: {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event receiver dropped");
            }
        }
    }
}
