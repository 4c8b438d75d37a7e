// # Plex Source
//
// Reports the first music session playing on a Plex Media Server.
//
// Sessions come from `GET {server_url}/status/sessions`, authenticated with
// the `X-Plex-Token` header. Only sessions of type `track` are considered;
// when `libraries` is configured, only sessions from those library sections
// count.
//
// Plex reports both `viewOffset` and `duration`, so tracks carry progress
// and the presence host can show a live timer.
//
// ## Security
//
// The token never appears in logs or `Debug` output.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tunecast_core::catalog::{self, SourceDescriptor};
use tunecast_core::config::SourceConfig;
use tunecast_core::track::{MAX_PLAYBACK_MS, Track};
use tunecast_core::{AdapterRegistry, Error, Result, SourceAdapter, SourceAdapterFactory};

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const SESSIONS_PATH: &str = "/status/sessions";

/// `GET /status/sessions` response
#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(rename = "MediaContainer")]
    container: MediaContainer,
}

#[derive(Debug, Deserialize)]
struct MediaContainer {
    // Absent when nothing is playing
    #[serde(rename = "Metadata", default)]
    metadata: Vec<Session>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
    grandparent_title: Option<String>,
    original_title: Option<String>,
    parent_title: Option<String>,
    view_offset: Option<u64>,
    duration: Option<u64>,
    library_section_title: Option<String>,
}

/// Plex session adapter
pub struct PlexAdapter {
    server_url: String,

    /// ⚠️ NEVER log this value
    token: String,

    /// Library sections to report from; empty means all
    libraries: Vec<String>,

    client: reqwest::Client,
}

impl std::fmt::Debug for PlexAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlexAdapter")
            .field("server_url", &self.server_url)
            .field("token", &"<REDACTED>")
            .field("libraries", &self.libraries)
            .finish()
    }
}

impl PlexAdapter {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            libraries: Vec::new(),
            client,
        })
    }

    /// Only report sessions from these library sections
    pub fn with_libraries(mut self, libraries: Vec<String>) -> Self {
        self.libraries = libraries;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn fetch_sessions(&self) -> Result<SessionsResponse> {
        let url = format!("{}{}", self.server_url, SESSIONS_PATH);
        let response = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::http(format!("Plex request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return match status.as_u16() {
                401 | 403 => Err(Error::http(format!(
                    "Authentication failed: Invalid Plex token. Status: {}",
                    status
                ))),
                404 => Err(Error::http(format!(
                    "Plex server has no session endpoint at {}. Status: {}",
                    self.server_url, status
                ))),
                500..=599 => Err(Error::http(format!(
                    "Plex server error (transient): {} - {}",
                    status, error_text
                ))),
                _ => Err(Error::http(format!(
                    "Session lookup failed: {} - {}",
                    status, error_text
                ))),
            };
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::http(format!("Plex response unreadable: {}", e)))?;
        parse_sessions(&body)
    }
}

#[async_trait]
impl SourceAdapter for PlexAdapter {
    fn descriptor(&self) -> &'static SourceDescriptor {
        &catalog::PLEX
    }

    async fn get_current_track(&self) -> Result<Option<Track>> {
        let sessions = self.fetch_sessions().await?;
        Ok(current_track(&sessions, &self.libraries))
    }
}

fn parse_sessions(body: &str) -> Result<SessionsResponse> {
    serde_json::from_str(body).map_err(|e| {
        Error::source(
            catalog::PLEX.display_name,
            format!("Malformed session list: {}", e),
        )
    })
}

/// First playable music session, optionally restricted to `libraries`
fn current_track(sessions: &SessionsResponse, libraries: &[String]) -> Option<Track> {
    sessions
        .container
        .metadata
        .iter()
        .filter(|s| s.kind == "track")
        .filter(|s| {
            libraries.is_empty()
                || s.library_section_title
                    .as_ref()
                    .is_some_and(|section| libraries.contains(section))
        })
        .find_map(to_track)
}

fn to_track(session: &Session) -> Option<Track> {
    let name = non_empty(&session.title)?;
    let artist = non_empty(&session.grandparent_title).or_else(|| non_empty(&session.original_title));
    let Some(artist) = artist else {
        tracing::debug!("Skipping Plex session {:?} without an artist", name);
        return None;
    };

    let mut track = Track::new(name, artist);
    if let Some(album) = non_empty(&session.parent_title) {
        track = track.with_album(album);
    }
    if let (Some(offset), Some(duration)) = (session.view_offset, session.duration)
        && duration > 0
        && duration <= MAX_PLAYBACK_MS
    {
        track = track.with_progress(offset.min(duration), duration);
    }
    Some(track)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Factory for creating Plex adapters
pub struct PlexFactory;

impl SourceAdapterFactory for PlexFactory {
    fn create(&self, config: &SourceConfig) -> Result<Box<dyn SourceAdapter>> {
        let server_url = config
            .setting_str("server_url")
            .ok_or_else(|| Error::config("Plex server_url is required"))?;
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(Error::config(format!(
                "Plex server_url must be an http(s) URL: {}",
                server_url
            )));
        }
        let token = config
            .setting_str("token")
            .ok_or_else(|| Error::config("Plex token is required"))?;

        let adapter =
            PlexAdapter::new(server_url, token)?.with_libraries(config.setting_list("libraries"));
        Ok(Box::new(adapter))
    }
}

/// Register the Plex adapter with a registry
pub fn register(registry: &AdapterRegistry) {
    registry.register_adapter(catalog::PLEX.key, Box::new(PlexFactory));
}
