// # Source Adapter Trait
//
// Defines the interface every music-service client implements.
//
// ## Implementations
//
// - Last.fm: `tunecast-source-lastfm` crate
// - Plex: `tunecast-source-plex` crate
// - Future: Spotify, SoundCloud (currently fed through the ingestion relay)
//
// ## Usage
//
// ```rust,ignore
// use tunecast_core::SourceAdapter;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let adapter = /* SourceAdapter implementation */;
//
//     if let Some(track) = adapter.get_current_track().await? {
//         println!("{} - {}", track.artist(), track.name());
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::catalog::SourceDescriptor;
use crate::config::SourceConfig;
use crate::track::Track;

/// Trait for music-service clients
///
/// # Contract
///
/// - Returns `Ok(None)` when nothing is playing
/// - Returns `Err` rather than a partially populated [`Track`]
/// - Performs one lookup per call; scheduling, retries and backoff are owned
///   by the `SourcePoller` driving the adapter
/// - Must not spawn background tasks
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The catalog entry this adapter reports for
    fn descriptor(&self) -> &'static SourceDescriptor;

    /// Display name of the source (e.g. "Last.fm")
    fn source_name(&self) -> &'static str {
        self.descriptor().display_name
    }

    /// Logo URL of the source
    fn source_image(&self) -> &'static str {
        self.descriptor().logo_url
    }

    /// Fetch the track currently playing, if any
    async fn get_current_track(&self) -> crate::Result<Option<Track>>;
}

/// Helper trait for constructing adapters from configuration
pub trait SourceAdapterFactory: Send + Sync {
    /// Create an adapter from the source's configuration section
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn SourceAdapter>)`: ready to be polled
    /// - `Err(Error)`: the section is incomplete (missing credentials, bad URL)
    fn create(&self, config: &SourceConfig) -> crate::Result<Box<dyn SourceAdapter>>;
}
