//! Error types for the tunecast system
//!
//! This module defines all error types used throughout the crate.
//!
//! - [`Error`]: general purpose error for sources, relay, config and I/O
//! - [`PresenceError`]: the three distinguishable presence channel faults
//! - [`RelayError`]: separates "keep the connection" from "drop the connection"

use thiserror::Error;

/// Result type alias for tunecast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for presence channel operations
pub type PresenceResult<T> = std::result::Result<T, PresenceError>;

/// Core error type for the tunecast system
#[derive(Error, Debug)]
pub enum Error {
    /// Source adapter errors (fetching the current track failed)
    #[error("Source error ({source_name}): {message}")]
    Source {
        /// Source display name
        source_name: String,
        /// Error message
        message: String,
    },

    /// Ingestion relay errors
    #[error("Relay error: {0}")]
    Relay(String),

    /// Presence channel errors
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors (from service APIs)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a source error
    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a relay error
    pub fn relay(msg: impl Into<String>) -> Self {
        Self::Relay(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Faults signalled by a presence channel
///
/// The supervisor picks a recovery policy per variant:
///
/// - [`PresenceError::ChannelSevered`]: every channel is torn down and reconnected
/// - [`PresenceError::HostUnreachable`]: longer backoff, then reconnect everything
/// - [`PresenceError::Channel`]: logged, short backoff, ticking resumes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// The connection to the presence host was lost mid-session
    #[error("presence channel severed")]
    ChannelSevered,

    /// The presence host could not be found (not running, no socket)
    #[error("presence host unreachable")]
    HostUnreachable,

    /// Any other channel failure reported by the host or the transport
    #[error("presence channel error: {0}")]
    Channel(String),
}

impl PresenceError {
    /// Create a generic channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Whether this fault invalidates every open channel
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::ChannelSevered | Self::HostUnreachable)
    }

    /// Short name used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelSevered => "severed",
            Self::HostUnreachable => "unreachable",
            Self::Channel(_) => "channel",
        }
    }
}

/// Faults raised while processing relay input
#[derive(Error, Debug)]
pub enum RelayError {
    /// The message body could not be decoded; the connection stays open
    #[error("malformed relay message: {0}")]
    Decode(String),

    /// The connection itself failed; its contributed track is dropped
    #[error("relay connection failed: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
