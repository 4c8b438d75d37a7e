//! Source registry
//!
//! Two pieces live here:
//!
//! - [`AdapterRegistry`]: plugin-style map from source key to
//!   [`SourceAdapterFactory`], so adapters are created from configuration
//!   without hard-coded if-else chains.
//! - [`SourceRegistry`]: the set of running pollers for one configuration
//!   value, answering "which sources are playing right now".
//!
//! ## Registration
//!
//! Adapter crates expose a `register()` function:
//!
//! ```rust,ignore
//! // In tunecast-source-lastfm
//! pub fn register(registry: &AdapterRegistry) {
//!     registry.register_adapter("lastfm", Box::new(LastFmFactory::default()));
//! }
//! ```
//!
//! ## Rebuilds
//!
//! A `SourceRegistry` is never mutated after construction. On configuration
//! change the supervisor stops the old registry (cancelling and joining every
//! poller task) before starting a new one.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::KNOWN_SOURCES;
use crate::config::{PresenceConfig, SourceConfig};
use crate::error::Result;
use crate::poller::{PollerHandle, SourcePoller};
use crate::track::TrackWithSource;
use crate::traits::{SourceAdapter, SourceAdapterFactory};

/// Registry of adapter factories keyed by source key
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, Box<dyn SourceAdapterFactory>>>,
}

impl AdapterRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter factory
    ///
    /// # Parameters
    ///
    /// - `key`: Source catalog key (e.g., "lastfm", "plex")
    /// - `factory`: Factory object for creating adapter instances
    pub fn register_adapter(&self, key: impl Into<String>, factory: Box<dyn SourceAdapterFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        factories.insert(key.into(), factory);
    }

    /// Create an adapter from a source's configuration section
    ///
    /// # Returns
    ///
    /// - `Ok(Some(adapter))`: created
    /// - `Ok(None)`: no factory registered for this key
    /// - `Err(Error)`: the factory rejected the configuration
    pub fn create_adapter(
        &self,
        key: &str,
        config: &SourceConfig,
    ) -> Result<Option<Box<dyn SourceAdapter>>> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);

        match factories.get(key) {
            Some(factory) => factory.create(config).map(Some),
            None => Ok(None),
        }
    }

    /// List all registered source keys
    pub fn list_adapters(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories.keys().cloned().collect()
    }

    /// Check if a source key has a registered factory
    pub fn has_adapter(&self, key: &str) -> bool {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories.contains_key(key)
    }
}

/// Running pollers for every enabled, adapter-backed source
pub struct SourceRegistry {
    pollers: Vec<PollerHandle>,
    cancel: CancellationToken,
}

impl SourceRegistry {
    /// Create and start pollers for the enabled sources in `config`
    ///
    /// Sources that are enabled but have no registered factory are expected
    /// to be fed through the ingestion relay and are skipped here. A factory
    /// error disables only that source.
    pub fn start(
        config: &PresenceConfig,
        adapters: &AdapterRegistry,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let mut pollers = Vec::new();

        for descriptor in KNOWN_SOURCES {
            let Some(section) = config.source(descriptor.key).filter(|s| s.enabled) else {
                continue;
            };

            match adapters.create_adapter(descriptor.key, section) {
                Ok(Some(adapter)) => {
                    let poller = SourcePoller::new(
                        adapter,
                        config.update_gap(descriptor),
                        config.timing.poll_error_backoff(),
                    );
                    pollers.push(poller.spawn(&cancel));
                }
                Ok(None) => {
                    debug!(
                        "No adapter registered for {}, expecting relay updates",
                        descriptor.display_name
                    );
                }
                Err(e) => {
                    warn!("Failed to initialise {}: {}", descriptor.display_name, e);
                }
            }
        }

        info!("Source registry started with {} poller(s)", pollers.len());

        Self { pollers, cancel }
    }

    /// Fresh tracks from every poller, in catalog order
    ///
    /// Every fresh source gets its own entry; there is no single winner.
    pub fn get_current_tracks(&self) -> Vec<TrackWithSource> {
        self.tracks_at(Instant::now())
    }

    /// Fresh tracks as seen at `now`
    pub fn tracks_at(&self, now: Instant) -> Vec<TrackWithSource> {
        self.pollers
            .iter()
            .filter_map(|poller| poller.current_track(now))
            .collect()
    }

    /// Keys of the sources being polled
    pub fn sources(&self) -> Vec<&'static str> {
        self.pollers.iter().map(|p| p.descriptor().key).collect()
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Stop every poller and wait for their tasks to exit
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for poller in self.pollers.drain(..) {
            poller.join().await;
        }
        debug!("Source registry stopped");
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        // Pollers are child tokens; this stops any that were not joined.
        self.cancel.cancel();
    }
}
