//! Core traits for the tunecast system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`SourceAdapter`]: Report the track currently playing on one music service
//! - [`PresenceChannel`]: Publish one activity slot on the presence host
//! - [`ConfigLoader`]: Produce the current configuration value

pub mod source_adapter;
pub mod presence_channel;

pub use source_adapter::{SourceAdapter, SourceAdapterFactory};
pub use presence_channel::{Activity, ActivityButton, PresenceChannel, PresenceChannelFactory};

use crate::config::PresenceConfig;

/// Produces configuration values for the supervisor
///
/// Called once per supervisor tick on the blocking pool, so reading a file is
/// fine. Must return a fresh value each time so that edits are picked up.
pub trait ConfigLoader: Send + Sync {
    /// Load the current configuration
    fn load(&self) -> crate::Result<PresenceConfig>;
}
