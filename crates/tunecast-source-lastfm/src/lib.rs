// # Last.fm Source
//
// Reports the track a Last.fm user is scrobbling right now.
//
// ## Behavior
//
// - One `user.getrecenttracks` request per poll (`limit=1`)
// - Only the entry flagged `@attr.nowplaying == "true"` counts as playing;
//   the most recent scrobble of a stopped player is ignored
// - Last.fm never reports a playback position, so tracks carry no progress
// - When the recent-tracks entry has no usable image, the album cover is
//   looked up with `album.getInfo` and kept for an hour (misses included)
//
// ## Security
//
// The API key never appears in logs or `Debug` output.
//
// ## API Reference
//
// - https://www.last.fm/api/show/user.getRecentTracks
// - https://www.last.fm/api/show/album.getInfo

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tunecast_core::catalog::{self, SourceDescriptor};
use tunecast_core::config::SourceConfig;
use tunecast_core::track::Track;
use tunecast_core::{
    AdapterRegistry, Error, ExpiringCache, Result, SourceAdapter, SourceAdapterFactory,
};

/// Last.fm API endpoint
const API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a cover-art lookup is trusted
pub const COVER_ART_TTL: Duration = Duration::from_secs(60 * 60);

/// Last.fm error code for an unknown album
const ERROR_NOT_FOUND: i64 = 6;

/// Image sizes used from recent-tracks entries, best first
const PREFERRED_SIZES: &[&str] = &["extralarge", "large"];

/// Cover art keyed by artist and album; `None` records a miss
pub type CoverArtCache = ExpiringCache<String, Option<String>>;

/// Last.fm now-playing adapter
pub struct LastFmAdapter {
    username: String,

    /// ⚠️ NEVER log this value
    api_key: String,

    api_base: String,

    client: reqwest::Client,

    cover_art: Arc<CoverArtCache>,
}

impl std::fmt::Debug for LastFmAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastFmAdapter")
            .field("username", &self.username)
            .field("api_key", &"<REDACTED>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl LastFmAdapter {
    /// Create an adapter with its own cover-art cache
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_cache(username, api_key, Arc::new(CoverArtCache::new(COVER_ART_TTL)))
    }

    /// Create an adapter sharing `cover_art` with other adapters
    pub fn with_cache(
        username: impl Into<String>,
        api_key: impl Into<String>,
        cover_art: Arc<CoverArtCache>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            username: username.into(),
            api_key: api_key.into(),
            api_base: API_BASE.to_string(),
            client,
            cover_art,
        })
    }

    /// Point the adapter at another API endpoint (proxies, tests)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Issue one API method call and return the decoded body
    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .client
            .get(&self.api_base)
            .query(&[
                ("method", method),
                ("api_key", self.api_key.as_str()),
                ("format", "json"),
            ])
            .query(params)
            .send()
            .await
            .map_err(|e| Error::http(format!("Last.fm request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return match status.as_u16() {
                401 | 403 => Err(Error::http(format!(
                    "Last.fm rejected the API key. Status: {}",
                    status
                ))),
                429 => Err(Error::http(format!(
                    "Last.fm rate limit exceeded. Status: {}",
                    status
                ))),
                500..=599 => Err(Error::http(format!(
                    "Last.fm server error (transient): {} - {}",
                    status, error_text
                ))),
                _ => Err(Error::http(format!(
                    "Last.fm {} failed: {} - {}",
                    method, status, error_text
                ))),
            };
        }

        response.json::<Value>().await.map_err(|e| {
            Error::source(
                catalog::LASTFM.display_name,
                format!("Malformed response: {}", e),
            )
        })
    }

    /// Cover art for an album, cached for [`COVER_ART_TTL`]
    async fn cover_art(&self, artist: &str, album: &str) -> Result<Option<String>> {
        let key = format!("{}_{}", artist, album);
        self.cover_art
            .get_or_fetch(key, || async {
                let body = self
                    .call("album.getInfo", &[("artist", artist), ("album", album)])
                    .await?;
                match api_error(&body) {
                    Some((ERROR_NOT_FOUND, _)) => Ok(None),
                    Some((code, message)) => Err(lastfm_error(code, &message)),
                    None => Ok(parse_album_art(&body)),
                }
            })
            .await
    }
}

#[async_trait]
impl SourceAdapter for LastFmAdapter {
    fn descriptor(&self) -> &'static SourceDescriptor {
        &catalog::LASTFM
    }

    async fn get_current_track(&self) -> Result<Option<Track>> {
        let body = self
            .call(
                "user.getrecenttracks",
                &[("user", self.username.as_str()), ("limit", "1")],
            )
            .await?;

        if let Some((code, message)) = api_error(&body) {
            return Err(lastfm_error(code, &message));
        }

        let Some(track) = parse_now_playing(&body)? else {
            return Ok(None);
        };

        if track.image().is_some() {
            return Ok(Some(track));
        }
        let Some(album) = track.album().map(str::to_string) else {
            return Ok(Some(track));
        };
        let artist = track.artist().to_string();

        match self.cover_art(&artist, &album).await {
            Ok(Some(image)) => Ok(Some(track.with_image(image))),
            Ok(None) => Ok(Some(track)),
            Err(e) => {
                tracing::debug!("Cover art lookup for {} failed: {}", album, e);
                Ok(Some(track))
            }
        }
    }
}

fn lastfm_error(code: i64, message: &str) -> Error {
    Error::source(
        catalog::LASTFM.display_name,
        format!("API error {}: {}", code, message),
    )
}

/// `(code, message)` of an API-level error body
fn api_error(body: &Value) -> Option<(i64, String)> {
    let code = body.get("error")?.as_i64()?;
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some((code, message))
}

/// Extract the now-playing track from a `user.getrecenttracks` body
///
/// `recenttracks.track` is an array, except for accounts with a single
/// scrobble where it is a bare object.
pub fn parse_now_playing(body: &Value) -> Result<Option<Track>> {
    let malformed = |what: &str| {
        Error::source(
            catalog::LASTFM.display_name,
            format!("Malformed response: {}", what),
        )
    };

    let recent = body
        .get("recenttracks")
        .ok_or_else(|| malformed("missing recenttracks"))?;

    let entry = match recent.get("track") {
        Some(Value::Array(tracks)) => tracks.first(),
        Some(track @ Value::Object(_)) => Some(track),
        None => None,
        Some(_) => return Err(malformed("recenttracks.track is not a list")),
    };
    let Some(entry) = entry else {
        return Ok(None);
    };

    let now_playing = entry
        .pointer("/@attr/nowplaying")
        .and_then(Value::as_str)
        == Some("true");
    if !now_playing {
        return Ok(None);
    }

    let name = text(entry.get("name")).ok_or_else(|| malformed("track without name"))?;
    let artist = entry
        .get("artist")
        .and_then(|a| text(a.get("#text")).or_else(|| text(a.get("name"))))
        .ok_or_else(|| malformed("track without artist"))?;

    let mut track = Track::new(name, artist);
    if let Some(album) = entry.get("album").and_then(|a| text(a.get("#text"))) {
        track = track.with_album(album);
    }
    if let Some(url) = text(entry.get("url")) {
        track = track.with_url(url);
    }
    if let Some(image) = preferred_image(entry.get("image")) {
        track = track.with_image(image);
    }
    Ok(Some(track))
}

/// Highest quality cover from an `album.getInfo` body
///
/// Images are listed smallest first.
pub fn parse_album_art(body: &Value) -> Option<String> {
    body.pointer("/album/image")?
        .as_array()?
        .iter()
        .rev()
        .find_map(|image| text(image.get("#text")))
}

fn preferred_image(images: Option<&Value>) -> Option<String> {
    let images = images?.as_array()?;
    PREFERRED_SIZES.iter().find_map(|size| {
        images
            .iter()
            .filter(|image| image.get("size").and_then(Value::as_str) == Some(size))
            .find_map(|image| text(image.get("#text")))
    })
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Factory for creating Last.fm adapters
///
/// Every adapter it creates shares one cover-art cache, so lookups survive
/// configuration reloads.
pub struct LastFmFactory {
    cover_art: Arc<CoverArtCache>,
}

impl LastFmFactory {
    pub fn new() -> Self {
        Self {
            cover_art: Arc::new(CoverArtCache::new(COVER_ART_TTL)),
        }
    }
}

impl Default for LastFmFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceAdapterFactory for LastFmFactory {
    fn create(&self, config: &SourceConfig) -> Result<Box<dyn SourceAdapter>> {
        let username = config
            .setting_str("username")
            .ok_or_else(|| Error::config("Last.fm username is required"))?;
        let api_key = config
            .setting_str("api_key")
            .ok_or_else(|| Error::config("Last.fm API key is required"))?;

        let mut adapter =
            LastFmAdapter::with_cache(username, api_key, Arc::clone(&self.cover_art))?;
        if let Some(api_base) = config.setting_str("api_base") {
            adapter = adapter.with_api_base(api_base);
        }
        Ok(Box::new(adapter))
    }
}

/// Register the Last.fm adapter with a registry
///
/// # Example
///
/// ```rust
/// use tunecast_core::AdapterRegistry;
///
/// let registry = AdapterRegistry::new();
/// tunecast_source_lastfm::register(&registry);
/// assert!(registry.has_adapter("lastfm"));
/// ```
pub fn register(registry: &AdapterRegistry) {
    registry.register_adapter(catalog::LASTFM.key, Box::new(LastFmFactory::new()));
}
