//! Configuration types for the tunecast system
//!
//! The configuration is an immutable value compared by structural equality.
//! The supervisor reloads it once per tick and rebuilds every dependent
//! component when it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{self, KNOWN_SOURCES, SourceDescriptor};
use crate::error::{Error, Result};
use crate::traits::ConfigLoader;

/// Main tunecast configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence display settings
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Ingestion relay listener settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Per-source settings keyed by catalog key (e.g. "spotify", "lastfm")
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,

    /// Loop cadences and backoff delays
    #[serde(default)]
    pub timing: TimingConfig,
}

impl PresenceConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a source, creating its section if needed
    pub fn with_source(mut self, key: impl Into<String>, source: SourceConfig) -> Self {
        self.sources.insert(key.into(), source);
        self
    }

    /// Settings for a source, looked up by key or display name
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(&catalog::source_key(name))
    }

    /// Whether a source is enabled
    ///
    /// Sources without a section are disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.source(name).is_some_and(|s| s.enabled)
    }

    /// Poll interval for a known source
    pub fn update_gap(&self, descriptor: &SourceDescriptor) -> Duration {
        self.source(descriptor.key)
            .and_then(|s| s.update_gap_ms)
            .map(Duration::from_millis)
            .unwrap_or(descriptor.default_update_gap)
    }

    /// Keys of every enabled known source, in catalog order
    pub fn enabled_sources(&self) -> Vec<String> {
        KNOWN_SOURCES
            .iter()
            .filter(|s| self.is_enabled(s.key))
            .map(|s| s.key.to_string())
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;

        if self.relay.enabled && self.relay.port == 0 {
            return Err(Error::config("relay.port must be > 0"));
        }

        for (key, source) in &self.sources {
            if source.update_gap_ms == Some(0) {
                return Err(Error::config(format!(
                    "sources.{}.update_gap_ms must be > 0",
                    key
                )));
            }

            if source.enabled && self.discord.client_id_for(key).is_none() {
                return Err(Error::config(format!(
                    "source '{}' is enabled but has no Discord application id \
                    (set discord.client_id or discord.client_ids.{})",
                    key, key
                )));
            }
        }

        Ok(())
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Serialize the configuration to YAML text
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Presence display settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Default Discord application id used for every source
    #[serde(default)]
    pub client_id: Option<String>,

    /// Per-source application ids, keyed by catalog key
    #[serde(default)]
    pub client_ids: BTreeMap<String, String>,

    /// Publish start/end timestamps so the host renders a progress bar
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// Show the source logo and name as the small image
    #[serde(default = "default_true")]
    pub show_source_logo: bool,

    /// Add a button linking to the track
    #[serde(default = "default_true")]
    pub show_urls: bool,

    /// Add a button linking to the project
    #[serde(default = "default_true")]
    pub show_ad: bool,
}

impl DiscordConfig {
    /// Application id for a source: the per-source override, else the default
    pub fn client_id_for(&self, key: &str) -> Option<&str> {
        self.client_ids
            .get(key)
            .or(self.client_id.as_ref())
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_ids: BTreeMap::new(),
            show_progress: true,
            show_source_logo: true,
            show_urls: true,
            show_ad: true,
        }
    }
}

/// Ingestion relay listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Whether the relay listener is started
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen host
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Maximum age of a relayed track before it is ignored
    ///
    /// Relay clients only send on change, so by default entries never expire
    /// and are dropped only on disconnect or an explicit empty update.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

impl RelayConfig {
    /// Address string suitable for binding
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_relay_host(),
            port: default_relay_port(),
            max_age_ms: None,
        }
    }
}

/// Settings for one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Whether this source is polled and displayed
    #[serde(default)]
    pub enabled: bool,

    /// Poll interval in milliseconds (catalog default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_gap_ms: Option<u64>,

    /// Service-specific settings (credentials, server URLs, ...)
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl SourceConfig {
    /// Create an enabled source section
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Set the poll interval
    pub fn with_update_gap_ms(mut self, update_gap_ms: u64) -> Self {
        self.update_gap_ms = Some(update_gap_ms);
        self
    }

    /// Add a service-specific setting
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// String setting; empty strings count as unset
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// List-of-strings setting
    pub fn setting_list(&self, key: &str) -> Vec<String> {
        self.settings
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Loop cadences and backoff delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Aggregator tick interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Delay before a failed poller retries
    #[serde(default = "default_poll_error_backoff_ms")]
    pub poll_error_backoff_ms: u64,

    /// Delay between attempts to load a valid configuration
    #[serde(default = "default_config_retry_ms")]
    pub config_retry_ms: u64,

    /// Delay after the presence channel was severed
    #[serde(default = "default_severed_backoff_ms")]
    pub severed_backoff_ms: u64,

    /// Delay after the presence host could not be reached
    #[serde(default = "default_unreachable_backoff_ms")]
    pub unreachable_backoff_ms: u64,

    /// Delay after a generic presence channel error
    #[serde(default = "default_channel_error_backoff_ms")]
    pub channel_error_backoff_ms: u64,

    /// Delay after an unexpected fault in the supervisor loop
    #[serde(default = "default_unexpected_error_backoff_ms")]
    pub unexpected_error_backoff_ms: u64,

    /// Capacity of the supervisor event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn poll_error_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_error_backoff_ms)
    }

    pub fn config_retry(&self) -> Duration {
        Duration::from_millis(self.config_retry_ms)
    }

    pub fn severed_backoff(&self) -> Duration {
        Duration::from_millis(self.severed_backoff_ms)
    }

    pub fn unreachable_backoff(&self) -> Duration {
        Duration::from_millis(self.unreachable_backoff_ms)
    }

    pub fn channel_error_backoff(&self) -> Duration {
        Duration::from_millis(self.channel_error_backoff_ms)
    }

    pub fn unexpected_error_backoff(&self) -> Duration {
        Duration::from_millis(self.unexpected_error_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        let values = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("poll_error_backoff_ms", self.poll_error_backoff_ms),
            ("config_retry_ms", self.config_retry_ms),
            ("severed_backoff_ms", self.severed_backoff_ms),
            ("unreachable_backoff_ms", self.unreachable_backoff_ms),
            ("channel_error_backoff_ms", self.channel_error_backoff_ms),
            ("unexpected_error_backoff_ms", self.unexpected_error_backoff_ms),
        ];

        for (name, value) in values {
            if value == 0 {
                return Err(Error::config(format!("timing.{} must be > 0", name)));
            }
        }

        if self.event_channel_capacity == 0 {
            return Err(Error::config("timing.event_channel_capacity must be > 0"));
        }

        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            poll_error_backoff_ms: default_poll_error_backoff_ms(),
            config_retry_ms: default_config_retry_ms(),
            severed_backoff_ms: default_severed_backoff_ms(),
            unreachable_backoff_ms: default_unreachable_backoff_ms(),
            channel_error_backoff_ms: default_channel_error_backoff_ms(),
            unexpected_error_backoff_ms: default_unexpected_error_backoff_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_relay_port() -> u16 {
    47474
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_poll_error_backoff_ms() -> u64 {
    5000
}

fn default_config_retry_ms() -> u64 {
    5000
}

fn default_severed_backoff_ms() -> u64 {
    1000
}

fn default_unreachable_backoff_ms() -> u64 {
    3000
}

fn default_channel_error_backoff_ms() -> u64 {
    1000
}

fn default_unexpected_error_backoff_ms() -> u64 {
    5000
}

fn default_event_channel_capacity() -> usize {
    1000
}

/// Loads the configuration from a YAML file on every call
///
/// A missing or empty file is replaced by the default configuration first so
/// users have a template to edit.
#[derive(Debug, Clone)]
pub struct YamlConfigLoader {
    path: PathBuf,
}

impl YamlConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_default(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, PresenceConfig::default().to_yaml_string()?)?;
        tracing::info!("Wrote default configuration to {}", self.path.display());
        Ok(())
    }
}

impl ConfigLoader for YamlConfigLoader {
    fn load(&self) -> Result<PresenceConfig> {
        let missing = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if missing {
            self.write_default()?;
        }

        let text = std::fs::read_to_string(&self.path)?;
        PresenceConfig::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PresenceConfig::default();
        assert!(config.discord.show_progress);
        assert!(config.relay.enabled);
        assert_eq!(config.relay.address(), "localhost:47474");
        assert_eq!(config.timing.tick_interval_ms, 1000);
        assert!(config.enabled_sources().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_flattened_settings() {
        let config = PresenceConfig::from_yaml_str(
            r#"
discord:
  client_id: "1234"
  show_ad: false
sources:
  lastfm:
    enabled: true
    username: someone
    api_key: secret
  plex:
    enabled: false
    libraries: [Music, Audiobooks]
"#,
        )
        .unwrap();

        assert!(!config.discord.show_ad);
        assert!(config.is_enabled("Last.fm"));
        assert!(!config.is_enabled("plex"));
        assert!(!config.is_enabled("spotify"));

        let lastfm = config.source("lastfm").unwrap();
        assert_eq!(lastfm.setting_str("username"), Some("someone"));
        assert_eq!(
            config.source("plex").unwrap().setting_list("libraries"),
            vec!["Music".to_string(), "Audiobooks".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_update_gap_falls_back_to_catalog() {
        let config = PresenceConfig::new()
            .with_source("spotify", SourceConfig::enabled().with_update_gap_ms(250));

        assert_eq!(config.update_gap(&catalog::SPOTIFY), Duration::from_millis(250));
        assert_eq!(config.update_gap(&catalog::LASTFM), catalog::LASTFM.default_update_gap);
    }

    #[test]
    fn test_enabled_source_requires_client_id() {
        let mut config = PresenceConfig::new().with_source("spotify", SourceConfig::enabled());
        assert!(config.validate().is_err());

        config
            .discord
            .client_ids
            .insert("spotify".to_string(), "42".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.discord.client_id_for("spotify"), Some("42"));
        assert_eq!(config.discord.client_id_for("plex"), None);
    }

    #[test]
    fn test_zero_timing_is_rejected() {
        let mut config = PresenceConfig::default();
        config.timing.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_structural_equality() {
        let a = PresenceConfig::new().with_source("lastfm", SourceConfig::enabled());
        let b = PresenceConfig::new().with_source("lastfm", SourceConfig::enabled());
        let c = PresenceConfig::new().with_source("lastfm", SourceConfig::default());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_yaml_loader_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let loader = YamlConfigLoader::new(&path);

        let config = loader.load().unwrap();
        assert_eq!(config, PresenceConfig::default());
        assert!(path.exists());

        std::fs::write(&path, "sources:\n  plex:\n    enabled: true\n").unwrap();
        let config = loader.load().unwrap();
        assert!(config.is_enabled("plex"));
    }
}
