// # tunecast-core
//
// Core library for the tunecast now-playing presence daemon.
//
// ## Architecture Overview
//
// - **SourceAdapter**: Trait for asking one music service what is playing
// - **SourcePoller / SourceRegistry**: Background polling with freshness rules
// - **RelayState / RelayServer**: Local websocket ingestion of pushed tracks
// - **PresenceChannel**: Trait for one activity slot on the presence host
// - **PresenceAggregator**: Publish/debounce algorithm over every slot
// - **Supervisor**: Tick loop, configuration reload, channel recovery
// - **AdapterRegistry**: Plugin-based registry for source adapters
//
// ## Data Flow
//
// Poller → Registry (pulled on read); relay connection → relay map (pushed
// on message); {Registry, Relay} → Aggregator (pulled each tick);
// Aggregator → presence channel (pushed each tick).

pub mod aggregator;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod poller;
pub mod registry;
pub mod relay;
pub mod supervisor;
pub mod track;
pub mod traits;

// Re-export core types for convenience
pub use aggregator::{PresenceAggregator, SlotOutcome};
pub use cache::ExpiringCache;
pub use catalog::{KNOWN_SOURCES, SourceDescriptor};
pub use config::{
    DiscordConfig, PresenceConfig, RelayConfig, SourceConfig, TimingConfig, YamlConfigLoader,
};
pub use error::{Error, PresenceError, PresenceResult, RelayError, Result};
pub use poller::{PollerHandle, Snapshot, SourcePoller};
pub use registry::{AdapterRegistry, SourceRegistry};
pub use relay::{RelayServer, RelayState};
pub use supervisor::{Supervisor, SupervisorEvent};
pub use track::{MAX_PLAYBACK_MS, Progress, Track, TrackIdentity, TrackWithSource};
pub use traits::{
    Activity, ActivityButton, ConfigLoader, PresenceChannel, PresenceChannelFactory,
    SourceAdapter, SourceAdapterFactory,
};
