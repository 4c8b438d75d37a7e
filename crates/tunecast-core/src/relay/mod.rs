//! Ingestion relay
//!
//! Local listener that merges track state pushed by auxiliary client
//! processes (browser userscripts, media-key bridges) into the same model the
//! pollers produce.
//!
//! ## Protocol
//!
//! Clients send JSON text frames, receive nothing back:
//!
//! ```json
//! {"type": "track_update", "data": {"name": "...", "artist": "..."}, "source": "YouTube", "source_image": "https://..."}
//! ```
//!
//! - Only `type == "track_update"` is recognised; other types are ignored.
//! - `data` of `null` / `{}` clears the connection's track.
//! - A disabled (or unknown) `source` clears the connection's track.
//! - Undecodable frames are logged and the connection stays open.
//! - Transport failures and disconnects drop the connection's track.
//!
//! ## Concurrency
//!
//! Connection tasks insert and remove entries while the supervisor iterates
//! the map, so the map lives behind a `tokio::sync::RwLock`.

pub mod server;

pub use server::RelayServer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::PresenceConfig;
use crate::error::RelayError;
use crate::track::{Track, TrackWithSource};

/// Identifier of one relay connection
pub type ConnectionId = u64;

/// The only message type the relay acts on
pub const TRACK_UPDATE: &str = "track_update";

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_image: Option<String>,
}

#[derive(Debug, Clone)]
struct RelayEntry {
    track: TrackWithSource,
    received_at: Instant,
}

/// Connection → track map shared by every relay connection
pub struct RelayState {
    clients: RwLock<BTreeMap<ConnectionId, Option<RelayEntry>>>,
    next_id: AtomicU64,
    config: watch::Receiver<PresenceConfig>,
}

impl RelayState {
    /// Create an empty relay state
    ///
    /// `config` is consulted on every message (source enablement) and every
    /// read (entry max age), so it follows configuration reloads.
    pub fn new(config: watch::Receiver<PresenceConfig>) -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a new connection
    pub async fn connect(&self) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut clients = self.clients.write().await;
        clients.insert(id, None);
        info!("Client connected. Total clients: {}", clients.len());
        id
    }

    /// Remove a connection and the track it contributed
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut clients = self.clients.write().await;
        clients.remove(&id);
        info!("Client disconnected. Total clients: {}", clients.len());
    }

    /// Number of live connections
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Process one text frame received on connection `id`
    ///
    /// # Returns
    ///
    /// - `Ok(())`: the message was applied or deliberately ignored
    /// - `Err(RelayError::Decode)`: the body was malformed; state is unchanged
    pub async fn handle_message(&self, id: ConnectionId, text: &str) -> Result<(), RelayError> {
        let message: InboundMessage = serde_json::from_str(text)?;

        if message.kind != TRACK_UPDATE {
            debug!("Ignoring relay message of type '{}'", message.kind);
            return Ok(());
        }

        if is_empty_payload(&message.data) {
            self.set_track(id, None).await;
            return Ok(());
        }

        let source = message
            .source
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| RelayError::Decode("track_update without source".to_string()))?;

        if !self.config.borrow().is_enabled(&source) {
            debug!("Relay source {} is disabled, clearing", source);
            self.set_track(id, None).await;
            return Ok(());
        }

        let track: Track = serde_json::from_value(message.data)?;
        let source_image = message
            .source_image
            .filter(|s| !s.is_empty())
            .or_else(|| catalog::find(&source).map(|d| d.logo_url.to_string()));

        debug!("Received track from {}: {} - {}", source, track.artist(), track.name());

        let entry = RelayEntry {
            track: TrackWithSource::new(track, source, source_image),
            received_at: Instant::now(),
        };
        self.set_track(id, Some(entry)).await;

        Ok(())
    }

    async fn set_track(&self, id: ConnectionId, entry: Option<RelayEntry>) {
        let mut clients = self.clients.write().await;
        // A late frame from a connection that already left must not resurrect it.
        if let Some(slot) = clients.get_mut(&id) {
            *slot = entry;
        }
    }

    /// Tracks of every connection, in connection order
    ///
    /// Several connections may report the same source; they are not
    /// deduplicated here.
    pub async fn get_current_tracks(&self) -> Vec<TrackWithSource> {
        self.tracks_at(Instant::now()).await
    }

    /// Tracks as seen at `now`, honouring `relay.max_age_ms`
    pub async fn tracks_at(&self, now: Instant) -> Vec<TrackWithSource> {
        let max_age = self.config.borrow().relay.max_age_ms.map(Duration::from_millis);
        let clients = self.clients.read().await;

        clients
            .values()
            .flatten()
            .filter(|entry| {
                max_age.is_none_or(|age| now.saturating_duration_since(entry.received_at) <= age)
            })
            .map(|entry| entry.track.clone())
            .collect()
    }

    /// Drive one connection until it ends, fails or `cancel` fires
    ///
    /// `frames` yields the text payload of each received frame. The stream
    /// ending is a disconnect; an `Err` item is a transport fault. Either way
    /// the connection's entry is removed before this returns.
    pub async fn serve_connection<S, E>(&self, mut frames: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: std::fmt::Display,
    {
        let id = self.connect().await;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };

            match frame {
                None => break,
                Some(Err(e)) => {
                    warn!("Client connection error: {}", RelayError::Transport(e.to_string()));
                    break;
                }
                Some(Ok(text)) => {
                    if let Err(e) = self.handle_message(id, &text).await {
                        warn!("{}", e);
                    }
                }
            }
        }

        self.disconnect(id).await;
    }
}

fn is_empty_payload(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn state(config: PresenceConfig) -> (RelayState, watch::Sender<PresenceConfig>) {
        let (tx, rx) = watch::channel(config);
        (RelayState::new(rx), tx)
    }

    fn youtube_enabled() -> PresenceConfig {
        PresenceConfig::new().with_source("youtube", SourceConfig::enabled())
    }

    fn update(source: &str, name: &str) -> String {
        serde_json::json!({
            "type": "track_update",
            "data": { "name": name, "artist": "Artist", "progress_ms": 1000, "duration_ms": 5000 },
            "source": source,
            "source_image": "https://example.com/logo.png",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_track_update_is_stored() {
        let (relay, _tx) = state(youtube_enabled());
        let id = relay.connect().await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();

        let tracks = relay.get_current_tracks().await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].source, "YouTube");
        assert_eq!(tracks[0].source_image.as_deref(), Some("https://example.com/logo.png"));
        assert_eq!(tracks[0].track.progress().map(|p| p.duration_ms), Some(5000));
    }

    #[tokio::test]
    async fn test_disabled_source_clears_entry() {
        let (relay, tx) = state(youtube_enabled());
        let id = relay.connect().await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();
        tx.send_replace(PresenceConfig::new());
        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();

        assert!(relay.get_current_tracks().await.is_empty());
        assert_eq!(relay.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_null_data_clears_entry() {
        let (relay, _tx) = state(youtube_enabled());
        let id = relay.connect().await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();
        relay
            .handle_message(id, r#"{"type":"track_update","data":null,"source":"YouTube"}"#)
            .await
            .unwrap();

        assert!(relay.get_current_tracks().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (relay, _tx) = state(youtube_enabled());
        let id = relay.connect().await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();
        relay
            .handle_message(id, r#"{"type":"hello","version":1}"#)
            .await
            .unwrap();

        assert_eq!(relay.get_current_tracks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_decode_errors() {
        let (relay, _tx) = state(youtube_enabled());
        let id = relay.connect().await;
        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();

        for bad in [
            "{not json",
            r#"{"data":{}}"#,
            r#"{"type":"track_update","data":{"name":"x"},"source":"YouTube"}"#,
            r#"{"type":"track_update","data":{"name":"x","artist":"y"}}"#,
            r#"{"type":"track_update","data":{"name":"x","artist":"y","progress_ms":0,"duration_ms":9.2233720368547e18},"source":"YouTube"}"#,
        ] {
            let result = relay.handle_message(id, bad).await;
            assert!(matches!(result, Err(RelayError::Decode(_))), "{}", bad);
        }

        // Previous track survives malformed input
        assert_eq!(relay.get_current_tracks().await[0].track.name(), "Song");
    }

    #[tokio::test]
    async fn test_connections_are_not_deduplicated() {
        let (relay, _tx) = state(youtube_enabled());
        let a = relay.connect().await;
        let b = relay.connect().await;

        relay.handle_message(a, &update("YouTube", "First")).await.unwrap();
        relay.handle_message(b, &update("YouTube", "Second")).await.unwrap();

        let names: Vec<String> = relay
            .get_current_tracks()
            .await
            .iter()
            .map(|t| t.track.name().to_string())
            .collect();
        assert_eq!(names, vec!["First", "Second"]);

        relay.disconnect(a).await;
        let tracks = relay.get_current_tracks().await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track.name(), "Second");
    }

    #[tokio::test]
    async fn test_max_age_expires_entries() {
        let mut config = youtube_enabled();
        config.relay.max_age_ms = Some(1_000);
        let (relay, _tx) = state(config);
        let id = relay.connect().await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();

        let now = Instant::now();
        assert_eq!(relay.tracks_at(now).await.len(), 1);
        assert!(relay.tracks_at(now + Duration::from_secs(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_late_frame_after_disconnect_is_dropped() {
        let (relay, _tx) = state(youtube_enabled());
        let id = relay.connect().await;
        relay.disconnect(id).await;

        relay.handle_message(id, &update("YouTube", "Song")).await.unwrap();
        assert!(relay.get_current_tracks().await.is_empty());
        assert_eq!(relay.client_count().await, 0);
    }
}
