// # Presence Channel Trait
//
// Defines the outbound connection representing one visible activity slot on
// the presence-display host.
//
// ## Implementations
//
// - Discord local IPC: `tunecast-discord` crate
//
// ## Error Model
//
// Every operation returns a `PresenceError`, which the supervisor maps onto a
// recovery policy (see `crate::error::PresenceError`). Implementations report
// faults; they never retry or back off themselves.

use async_trait::async_trait;

use crate::catalog::SourceDescriptor;
use crate::error::PresenceResult;

/// A link button attached to an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityButton {
    pub label: String,
    pub url: String,
}

/// Fields published for one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activity {
    /// Track title
    pub details: String,
    /// Track artist
    pub state: String,
    /// Cover image (URL or host asset key)
    pub large_image: String,
    /// Album title
    pub large_text: Option<String>,
    /// Source logo
    pub small_image: Option<String>,
    /// Source name ("Listening on ...")
    pub small_text: Option<String>,
    /// Link buttons, at most two
    pub buttons: Vec<ActivityButton>,
    /// Playback start, epoch milliseconds
    pub start_ms: Option<i64>,
    /// Playback end, epoch milliseconds
    pub end_ms: Option<i64>,
}

/// Trait for presence channel implementations
///
/// One channel exists per statically known source. The aggregator owns its
/// channels exclusively, so operations take `&mut self`.
#[async_trait]
pub trait PresenceChannel: Send {
    /// Open the connection to the presence host
    async fn connect(&mut self) -> PresenceResult<()>;

    /// Replace the displayed activity
    async fn update(&mut self, activity: &Activity) -> PresenceResult<()>;

    /// Remove the displayed activity
    async fn clear(&mut self) -> PresenceResult<()>;

    /// Close the connection; the channel may be connected again later
    async fn close(&mut self) -> PresenceResult<()>;
}

/// Helper trait for constructing one channel per known source
pub trait PresenceChannelFactory: Send + Sync {
    /// Create the (unconnected) channel bound to a source's application id
    fn create(
        &self,
        source: &'static SourceDescriptor,
        client_id: &str,
    ) -> PresenceResult<Box<dyn PresenceChannel>>;
}
