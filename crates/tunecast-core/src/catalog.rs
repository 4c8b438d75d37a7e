//! Statically known sources
//!
//! Every source in [`KNOWN_SOURCES`] owns one presence slot (and one presence
//! channel) for the whole lifetime of an aggregator, whether or not it is
//! currently reporting anything.

use std::time::Duration;

/// Descriptor of a statically known source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Catalog key, also the configuration section name
    pub key: &'static str,
    /// Display name shown on the presence host
    pub display_name: &'static str,
    /// Logo shown as the small presence image
    pub logo_url: &'static str,
    /// Poll interval used when the configuration does not set one
    pub default_update_gap: Duration,
}

pub const SPOTIFY: SourceDescriptor = SourceDescriptor {
    key: "spotify",
    display_name: "Spotify",
    logo_url: "https://storage.googleapis.com/pr-newsroom-wp/1/2023/05/Spotify_Primary_Logo_RGB_Green.png",
    default_update_gap: Duration::from_secs(1),
};

pub const LASTFM: SourceDescriptor = SourceDescriptor {
    key: "lastfm",
    display_name: "Last.fm",
    logo_url: "https://www.last.fm/static/images/lastfm_avatar_twitter.52a5d69a85ac.png",
    default_update_gap: Duration::from_secs(5),
};

pub const PLEX: SourceDescriptor = SourceDescriptor {
    key: "plex",
    display_name: "Plex",
    logo_url: "https://www.plex.tv/wp-content/uploads/2022/09/plexamp-app-icon.png",
    default_update_gap: Duration::from_secs(1),
};

pub const SOUNDCLOUD: SourceDescriptor = SourceDescriptor {
    key: "soundcloud",
    display_name: "SoundCloud",
    logo_url: "https://d21buns5ku92am.cloudfront.net/26628/images/419679-1x1_SoundCloudLogo_cloudmark-f5912b-large-1645807040.jpg",
    default_update_gap: Duration::from_secs(2),
};

pub const YOUTUBE: SourceDescriptor = SourceDescriptor {
    key: "youtube",
    display_name: "YouTube",
    logo_url: "https://music.youtube.com/img/cairo/favicon_144.png",
    default_update_gap: Duration::from_secs(2),
};

pub const AMPCAST: SourceDescriptor = SourceDescriptor {
    key: "ampcast",
    display_name: "Ampcast",
    logo_url: "https://ampcast.app/apple-touch-icon.png",
    default_update_gap: Duration::from_secs(2),
};

/// All statically known sources, in presence slot order
pub const KNOWN_SOURCES: &[SourceDescriptor] =
    &[SPOTIFY, LASTFM, PLEX, SOUNDCLOUD, YOUTUBE, AMPCAST];

/// Catalog key for a source display name
///
/// `"Last.fm"` becomes `"lastfm"`, `"SoundCloud"` becomes `"soundcloud"`.
pub fn source_key(display_name: &str) -> String {
    display_name
        .chars()
        .filter(|c| *c != '.')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Look up a known source by key or display name
pub fn find(name: &str) -> Option<&'static SourceDescriptor> {
    let key = source_key(name);
    KNOWN_SOURCES.iter().find(|source| source.key == key)
}
