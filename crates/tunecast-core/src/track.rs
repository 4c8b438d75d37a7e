//! Track model
//!
//! A [`Track`] is an immutable value describing one playing item. Adapters and
//! relay clients produce a fresh [`TrackWithSource`] every time they report.
//!
//! Playback position is modelled as a single optional [`Progress`] so that a
//! track can never carry a position without a duration (or the reverse).

use serde::Deserialize;

use crate::catalog::source_key;

/// Longest position or duration accepted from a source (one week)
pub const MAX_PLAYBACK_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Playback position of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Elapsed playback time in milliseconds
    pub progress_ms: u64,
    /// Total track length in milliseconds
    pub duration_ms: u64,
}

/// One playing item
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTrack")]
pub struct Track {
    name: String,
    artist: String,
    album: Option<String>,
    url: Option<String>,
    image: Option<String>,
    progress: Option<Progress>,
}

impl Track {
    /// Create a track without album, links or progress
    pub fn new(name: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artist: artist.into(),
            album: None,
            url: None,
            image: None,
            progress: None,
        }
    }

    /// Set the album title
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    /// Set the track URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the cover image URL
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the playback position
    pub fn with_progress(mut self, progress_ms: u64, duration_ms: u64) -> Self {
        self.progress = Some(Progress {
            progress_ms,
            duration_ms,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn progress(&self) -> Option<Progress> {
        self.progress
    }
}

/// Wire shape of a track as sent by relay clients
///
/// Browser clients report positions as floating point milliseconds and use
/// `0` as the duration when they do not know it.
#[derive(Debug, Deserialize)]
struct RawTrack {
    name: Option<String>,
    artist: Option<String>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    progress_ms: Option<f64>,
    #[serde(default)]
    duration_ms: Option<f64>,
}

impl TryFrom<RawTrack> for Track {
    type Error = String;

    fn try_from(raw: RawTrack) -> std::result::Result<Self, Self::Error> {
        let name = non_empty(raw.name).ok_or("track name is missing")?;
        let artist = non_empty(raw.artist).ok_or("track artist is missing")?;

        let progress = match (raw.progress_ms, raw.duration_ms) {
            (None, None) => None,
            (Some(progress), Some(duration)) => {
                let progress_ms = millis(progress)?;
                let duration_ms = millis(duration)?;
                (duration_ms > 0).then_some(Progress {
                    progress_ms,
                    duration_ms,
                })
            }
            _ => return Err("progress_ms and duration_ms must be supplied together".to_string()),
        };

        Ok(Self {
            name,
            artist,
            album: non_empty(raw.album),
            url: non_empty(raw.url),
            image: non_empty(raw.image),
            progress,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn millis(value: f64) -> std::result::Result<u64, String> {
    if !value.is_finite() || value < 0.0 || value > MAX_PLAYBACK_MS as f64 {
        return Err(format!("invalid millisecond value: {}", value));
    }
    Ok(value.round() as u64)
}

/// A track together with the source that reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackWithSource {
    /// The reported track
    pub track: Track,
    /// Source display name (e.g. "Spotify", "Last.fm")
    pub source: String,
    /// Source logo URL
    pub source_image: Option<String>,
}

impl TrackWithSource {
    pub fn new(track: Track, source: impl Into<String>, source_image: Option<String>) -> Self {
        Self {
            track,
            source: source.into(),
            source_image,
        }
    }

    /// Catalog key of the reporting source
    pub fn source_key(&self) -> String {
        source_key(&self.source)
    }

    /// Identity used for progress continuity
    pub fn identity(&self) -> TrackIdentity {
        TrackIdentity {
            name: self.track.name.clone(),
            artist: self.track.artist.clone(),
            album: self.track.album.clone(),
            source: self.source_key(),
        }
    }
}

/// `(name, artist, album, source)` tuple identifying a track across ticks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackIdentity {
    pub name: String,
    pub artist: String,
    pub album: Option<String>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_track() {
        let track: Track = serde_json::from_value(serde_json::json!({
            "name": "Windowlicker",
            "artist": "Aphex Twin",
            "url": "https://example.com/watch?v=1",
            "image": null,
            "progress_ms": 12345.6,
            "duration_ms": 367000.0,
        }))
        .unwrap();

        assert_eq!(track.name(), "Windowlicker");
        assert_eq!(track.album(), None);
        assert_eq!(track.image(), None);
        assert_eq!(
            track.progress(),
            Some(Progress {
                progress_ms: 12346,
                duration_ms: 367000,
            })
        );
    }

    #[test]
    fn test_progress_requires_duration() {
        let result: std::result::Result<Track, _> = serde_json::from_value(serde_json::json!({
            "name": "A",
            "artist": "B",
            "progress_ms": 1000,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_duration_means_unknown_progress() {
        let track: Track = serde_json::from_value(serde_json::json!({
            "name": "A",
            "artist": "B",
            "progress_ms": 0,
            "duration_ms": 0,
        }))
        .unwrap();
        assert_eq!(track.progress(), None);
    }

    #[test]
    fn test_out_of_range_positions_are_rejected() {
        for (progress, duration) in [(0.0, 9.2233720368547e18), (-1.0, 1000.0), (1e300, 1000.0)] {
            let result: std::result::Result<Track, _> = serde_json::from_value(serde_json::json!({
                "name": "A",
                "artist": "B",
                "progress_ms": progress,
                "duration_ms": duration,
            }));
            assert!(result.is_err(), "{} / {} accepted", progress, duration);
        }

        let longest: Track = serde_json::from_value(serde_json::json!({
            "name": "A",
            "artist": "B",
            "progress_ms": 0,
            "duration_ms": MAX_PLAYBACK_MS,
        }))
        .unwrap();
        assert_eq!(longest.progress().unwrap().duration_ms, MAX_PLAYBACK_MS);
    }

    #[test]
    fn test_missing_artist_is_rejected() {
        let result: std::result::Result<Track, _> =
            serde_json::from_value(serde_json::json!({ "name": "A", "artist": "  " }));
        assert!(result.is_err());
    }

    #[test]
    fn test_identity_includes_album_and_source() {
        let a = TrackWithSource::new(Track::new("A", "B").with_album("X"), "Last.fm", None);
        let b = TrackWithSource::new(Track::new("A", "B").with_album("Y"), "Last.fm", None);
        let c = TrackWithSource::new(Track::new("A", "B").with_album("X"), "Spotify", None);

        assert_eq!(a.identity().source, "lastfm");
        assert_ne!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());

        let progressed = TrackWithSource::new(
            Track::new("A", "B").with_album("X").with_progress(5, 10),
            "Last.fm",
            None,
        );
        assert_eq!(a.identity(), progressed.identity());
    }
}
