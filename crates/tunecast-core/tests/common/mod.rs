//! Test doubles and common utilities for contract tests
//!
//! Every double records what it was asked to do through shared handles, so a
//! test keeps a handle while the supervisor owns the double itself.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tunecast_core::catalog::SourceDescriptor;
use tunecast_core::config::{PresenceConfig, SourceConfig, TimingConfig};
use tunecast_core::error::{Error, PresenceError, PresenceResult, Result};
use tunecast_core::track::Track;
use tunecast_core::traits::{
    Activity, ConfigLoader, PresenceChannel, PresenceChannelFactory, SourceAdapter,
    SourceAdapterFactory,
};

/// Shared state behind a [`ControlledAdapter`]
#[derive(Clone, Default)]
pub struct AdapterHandle {
    track: Arc<Mutex<Option<Track>>>,
    failing: Arc<Mutex<bool>>,
    calls: Arc<AtomicUsize>,
}

impl AdapterHandle {
    /// Report `track` from the next poll on
    pub fn set_track(&self, track: Option<Track>) {
        *self.track.lock().unwrap() = track;
    }

    /// Make every poll fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Number of get_current_track() calls
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A source adapter whose answer is set by the test
pub struct ControlledAdapter {
    descriptor: &'static SourceDescriptor,
    handle: AdapterHandle,
}

impl ControlledAdapter {
    pub fn new(descriptor: &'static SourceDescriptor, handle: AdapterHandle) -> Self {
        Self { descriptor, handle }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ControlledAdapter {
    fn descriptor(&self) -> &'static SourceDescriptor {
        self.descriptor
    }

    async fn get_current_track(&self) -> Result<Option<Track>> {
        self.handle.calls.fetch_add(1, Ordering::SeqCst);

        if *self.handle.failing.lock().unwrap() {
            return Err(Error::source(self.descriptor.display_name, "simulated failure"));
        }
        Ok(self.handle.track.lock().unwrap().clone())
    }
}

/// Factory creating [`ControlledAdapter`]s that share one handle
pub struct ControlledAdapterFactory {
    descriptor: &'static SourceDescriptor,
    handle: AdapterHandle,
    created: Arc<AtomicUsize>,
}

impl ControlledAdapterFactory {
    pub fn new(descriptor: &'static SourceDescriptor) -> (Self, AdapterHandle) {
        let handle = AdapterHandle::default();
        let factory = Self {
            descriptor,
            handle: handle.clone(),
            created: Arc::new(AtomicUsize::new(0)),
        };
        (factory, handle)
    }
}

impl SourceAdapterFactory for ControlledAdapterFactory {
    fn create(&self, _config: &SourceConfig) -> Result<Box<dyn SourceAdapter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ControlledAdapter::new(
            self.descriptor,
            self.handle.clone(),
        )))
    }
}

/// One recorded presence channel operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Connect { source: String },
    Update { source: String, activity: Activity },
    Clear { source: String },
    Close { source: String },
}

impl ChannelCall {
    pub fn source(&self) -> &str {
        match self {
            Self::Connect { source }
            | Self::Update { source, .. }
            | Self::Clear { source }
            | Self::Close { source } => source,
        }
    }
}

/// Shared log and scripted failures for every [`RecordingChannel`]
#[derive(Clone, Default)]
pub struct ChannelLog {
    calls: Arc<Mutex<Vec<ChannelCall>>>,
    update_failures: Arc<Mutex<VecDeque<PresenceError>>>,
    connect_failures: Arc<Mutex<VecDeque<PresenceError>>>,
    rejections: Arc<Mutex<Vec<(String, String)>>>,
}

impl ChannelLog {
    /// Every call so far, in order
    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Forget recorded calls
    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Activities published for `source`
    pub fn updates_for(&self, source: &str) -> Vec<Activity> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChannelCall::Update { source: s, activity } if s == source => Some(activity),
                _ => None,
            })
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ChannelCall::Update { .. }))
            .count()
    }

    pub fn clear_count(&self, source: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ChannelCall::Clear { source: s } if s == source))
            .count()
    }

    pub fn connect_count(&self, source: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ChannelCall::Connect { source: s } if s == source))
            .count()
    }

    pub fn close_count(&self, source: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ChannelCall::Close { source: s } if s == source))
            .count()
    }

    /// Fail the next update() on any channel with `err`
    pub fn fail_next_update(&self, err: PresenceError) {
        self.update_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next connect() on any channel with `err`
    pub fn fail_next_connect(&self, err: PresenceError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    /// Reject every update() on `source`'s channel with a generic error
    pub fn reject_updates_for(&self, source: &str, message: &str) {
        self.rejections
            .lock()
            .unwrap()
            .push((source.to_string(), message.to_string()));
    }

    fn rejection_for(&self, source: &str) -> Option<PresenceError> {
        self.rejections
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == source)
            .map(|(_, message)| PresenceError::channel(message.clone()))
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// A presence channel that records every operation
pub struct RecordingChannel {
    source: String,
    log: ChannelLog,
    connected: bool,
}

#[async_trait::async_trait]
impl PresenceChannel for RecordingChannel {
    async fn connect(&mut self) -> PresenceResult<()> {
        if let Some(err) = self.log.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.connected = true;
        self.log.record(ChannelCall::Connect {
            source: self.source.clone(),
        });
        Ok(())
    }

    async fn update(&mut self, activity: &Activity) -> PresenceResult<()> {
        if !self.connected {
            return Err(PresenceError::ChannelSevered);
        }
        if let Some(err) = self.log.update_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.log.rejection_for(&self.source) {
            return Err(err);
        }
        self.log.record(ChannelCall::Update {
            source: self.source.clone(),
            activity: activity.clone(),
        });
        Ok(())
    }

    async fn clear(&mut self) -> PresenceResult<()> {
        if !self.connected {
            return Err(PresenceError::ChannelSevered);
        }
        self.log.record(ChannelCall::Clear {
            source: self.source.clone(),
        });
        Ok(())
    }

    async fn close(&mut self) -> PresenceResult<()> {
        self.connected = false;
        self.log.record(ChannelCall::Close {
            source: self.source.clone(),
        });
        Ok(())
    }
}

/// Factory creating [`RecordingChannel`]s that share one log
#[derive(Clone, Default)]
pub struct RecordingChannelFactory {
    log: ChannelLog,
}

impl RecordingChannelFactory {
    pub fn new() -> (Self, ChannelLog) {
        let factory = Self::default();
        let log = factory.log.clone();
        (factory, log)
    }
}

impl PresenceChannelFactory for RecordingChannelFactory {
    fn create(
        &self,
        source: &'static SourceDescriptor,
        _client_id: &str,
    ) -> PresenceResult<Box<dyn PresenceChannel>> {
        Ok(Box::new(RecordingChannel {
            source: source.key.to_string(),
            log: self.log.clone(),
            connected: false,
        }))
    }
}

/// A config loader whose value is swapped by the test
#[derive(Clone)]
pub struct SwappableConfigLoader {
    current: Arc<Mutex<std::result::Result<PresenceConfig, String>>>,
}

impl SwappableConfigLoader {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            current: Arc::new(Mutex::new(Ok(config))),
        }
    }

    pub fn set(&self, config: PresenceConfig) {
        *self.current.lock().unwrap() = Ok(config);
    }

    /// Make every load fail with a configuration error
    pub fn set_broken(&self, reason: &str) {
        *self.current.lock().unwrap() = Err(reason.to_string());
    }
}

impl ConfigLoader for SwappableConfigLoader {
    fn load(&self) -> Result<PresenceConfig> {
        self.current.lock().unwrap().clone().map_err(Error::config)
    }
}

/// Timings short enough for tests
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        tick_interval_ms: 20,
        poll_error_backoff_ms: 20,
        config_retry_ms: 20,
        severed_backoff_ms: 20,
        unreachable_backoff_ms: 40,
        channel_error_backoff_ms: 20,
        unexpected_error_backoff_ms: 20,
        event_channel_capacity: 10_000,
    }
}

/// Config with a default application id, fast timings and no relay
pub fn test_config() -> PresenceConfig {
    let mut config = PresenceConfig::new();
    config.discord.client_id = Some("test-client".to_string());
    config.relay.enabled = false;
    config.timing = fast_timing();
    config
}

/// `test_config()` with `key` enabled and polled every `update_gap_ms`
pub fn config_with_source(key: &str, update_gap_ms: u64) -> PresenceConfig {
    test_config().with_source(key, SourceConfig::enabled().with_update_gap_ms(update_gap_ms))
}

/// Wait until `condition` holds, polling every 5ms, or panic after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
