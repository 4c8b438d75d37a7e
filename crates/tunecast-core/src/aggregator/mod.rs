//! Presence aggregator
//!
//! Owns one [`PresenceChannel`] per statically known source and decides, once
//! per tick, what to publish on each.
//!
//! ## Per-source algorithm
//!
//! 1. Pick the first candidate whose source matches the slot. Candidates are
//!    polled tracks followed by relayed tracks, so polled sources win ties.
//! 2. Disabled source or no candidate: clear the channel, forget the track.
//! 3. A different `(name, artist, album, source)` forgets the last progress.
//! 4. With progress: unchanged `progress_ms` skips the publish (the host
//!    interpolates elapsed time itself); otherwise the start/end timestamps
//!    are rebuilt as `now - progress` and `start + duration`.
//! 5. Without progress: publish a static activity.
//!
//! Republishing an activity identical to the one already shown is skipped,
//! and clearing is only sent when the slot may be showing something.
//!
//! ## Failures
//!
//! A severed or unreachable host aborts the pass at once and is returned as
//! an error. A generic channel error only fails its own slot: it is reported
//! as [`SlotOutcome::Failed`] and the remaining slots are still published.
//! The caller owns the recovery policy (see [`PresenceError`]).

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::{KNOWN_SOURCES, SourceDescriptor};
use crate::config::{DiscordConfig, PresenceConfig};
use crate::error::{PresenceError, PresenceResult};
use crate::track::{TrackIdentity, TrackWithSource};
use crate::traits::{Activity, ActivityButton, PresenceChannel, PresenceChannelFactory};

/// Host asset shown when a track has no cover image
pub const FALLBACK_LARGE_IMAGE: &str = "music";

/// Link shown by the promotional button
pub const PROMO_URL: &str = "https://github.com/tunecast/tunecast";

/// Label of the promotional button
pub const PROMO_LABEL: &str = "Get tunecast";

/// Minimum length of any text field accepted by the host
pub const MIN_TEXT_LEN: usize = 2;

/// Maximum length of any text field accepted by the host
pub const MAX_TEXT_LEN: usize = 128;

/// Maximum length of a button label accepted by the host
pub const MAX_BUTTON_LABEL_LEN: usize = 32;

/// What happened to one source during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// A new activity was published
    Published {
        source: &'static str,
        activity: Activity,
    },
    /// A candidate existed but nothing needed publishing
    Skipped { source: &'static str },
    /// The channel was cleared
    Cleared { source: &'static str },
    /// No candidate and the channel was already clear
    Idle { source: &'static str },
    /// The channel refused the call; the slot will be retried
    Failed {
        source: &'static str,
        error: PresenceError,
    },
}

impl SlotOutcome {
    pub fn source(&self) -> &'static str {
        match self {
            Self::Published { source, .. }
            | Self::Skipped { source }
            | Self::Cleared { source }
            | Self::Idle { source }
            | Self::Failed { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shown {
    /// Fresh connection; the host may still show a stale activity
    Unknown,
    Cleared,
    Showing,
}

struct PresenceSlot {
    descriptor: &'static SourceDescriptor,
    channel: Option<Box<dyn PresenceChannel>>,
    last_track: Option<TrackIdentity>,
    last_progress: Option<u64>,
    last_activity: Option<Activity>,
    shown: Shown,
}

impl PresenceSlot {
    fn forget(&mut self) {
        self.last_track = None;
        self.last_progress = None;
        self.last_activity = None;
    }
}

/// Publishes the merged track state to the presence host
pub struct PresenceAggregator {
    slots: Vec<PresenceSlot>,
    display: DiscordConfig,
    enabled: HashSet<String>,
    connected: bool,
}

impl PresenceAggregator {
    /// Create one (unconnected) channel per known source
    ///
    /// Sources without an application id, or whose channel cannot be
    /// created, keep their slot but publish nowhere.
    pub fn new(config: &PresenceConfig, channels: Arc<dyn PresenceChannelFactory>) -> Self {
        let slots = KNOWN_SOURCES
            .iter()
            .map(|descriptor| {
                let channel = match config.discord.client_id_for(descriptor.key) {
                    Some(client_id) => match channels.create(descriptor, client_id) {
                        Ok(channel) => Some(channel),
                        Err(e) => {
                            warn!(
                                "Failed to create presence channel for {}: {}",
                                descriptor.display_name, e
                            );
                            None
                        }
                    },
                    None => {
                        debug!("No application id for {}", descriptor.display_name);
                        None
                    }
                };

                PresenceSlot {
                    descriptor,
                    channel,
                    last_track: None,
                    last_progress: None,
                    last_activity: None,
                    shown: Shown::Unknown,
                }
            })
            .collect();

        Self {
            slots,
            display: config.discord.clone(),
            enabled: config.enabled_sources().into_iter().collect(),
            connected: false,
        }
    }

    /// Whether every channel is connected
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of slots that own a channel
    pub fn channel_count(&self) -> usize {
        self.slots.iter().filter(|s| s.channel.is_some()).count()
    }

    /// Connect every channel
    ///
    /// Fails on the first channel that cannot connect, after closing every
    /// channel again: the set is connected as a whole or not at all.
    pub async fn connect(&mut self) -> PresenceResult<()> {
        if let Err(e) = self.connect_all().await {
            self.close().await;
            return Err(e);
        }

        self.connected = true;
        info!("Connected {} presence channel(s)", self.channel_count());
        Ok(())
    }

    async fn connect_all(&mut self) -> PresenceResult<()> {
        for slot in &mut self.slots {
            slot.forget();
            slot.shown = Shown::Unknown;

            if let Some(channel) = slot.channel.as_mut() {
                debug!("Connecting presence channel for {}", slot.descriptor.display_name);
                channel.connect().await?;
            }
        }
        Ok(())
    }

    /// Run the publish algorithm for every slot
    ///
    /// # Parameters
    ///
    /// - `candidates`: polled tracks followed by relayed tracks
    /// - `now_ms`: wall clock, epoch milliseconds
    pub async fn update(
        &mut self,
        candidates: &[TrackWithSource],
        now_ms: i64,
    ) -> PresenceResult<Vec<SlotOutcome>> {
        let mut outcomes = Vec::with_capacity(self.slots.len());

        for slot in &mut self.slots {
            let source = slot.descriptor.key;
            let candidate = if self.enabled.contains(source) {
                candidates.iter().find(|c| c.source_key() == source)
            } else {
                None
            };

            let Some(candidate) = candidate else {
                slot.forget();

                if slot.shown == Shown::Cleared {
                    outcomes.push(SlotOutcome::Idle { source });
                    continue;
                }

                if let Some(channel) = slot.channel.as_mut()
                    && let Err(e) = channel.clear().await
                {
                    outcomes.push(slot_failure(e, slot.descriptor)?);
                    continue;
                }
                slot.shown = Shown::Cleared;
                debug!("Cleared presence for {}", slot.descriptor.display_name);
                outcomes.push(SlotOutcome::Cleared { source });
                continue;
            };

            let identity = candidate.identity();
            if slot.last_track.as_ref() != Some(&identity) {
                slot.last_progress = None;
            }

            let progress = candidate.track.progress();
            if let Some(progress) = progress
                && slot.last_progress == Some(progress.progress_ms)
            {
                outcomes.push(SlotOutcome::Skipped { source });
                continue;
            }

            let timestamps =
                progress.map(|p| playback_window(now_ms, p.progress_ms, p.duration_ms));
            let activity = build_activity(candidate, &self.display, timestamps);

            if slot.shown == Shown::Showing && slot.last_activity.as_ref() == Some(&activity) {
                slot.last_track = Some(identity);
                slot.last_progress = progress.map(|p| p.progress_ms);
                outcomes.push(SlotOutcome::Skipped { source });
                continue;
            }

            if let Some(channel) = slot.channel.as_mut()
                && let Err(e) = channel.update(&activity).await
            {
                outcomes.push(slot_failure(e, slot.descriptor)?);
                continue;
            }

            debug!(
                "Published {} - {} on {}",
                candidate.track.artist(),
                candidate.track.name(),
                slot.descriptor.display_name
            );

            // Only a delivered publish moves the slot forward.
            slot.shown = Shown::Showing;
            slot.last_track = Some(identity);
            slot.last_progress = progress.map(|p| p.progress_ms);
            slot.last_activity = Some(activity.clone());
            outcomes.push(SlotOutcome::Published { source, activity });
        }

        Ok(outcomes)
    }

    /// Clear and close every channel
    ///
    /// Errors are logged, never returned: closing is best-effort and must
    /// reach every channel.
    pub async fn close(&mut self) {
        for slot in &mut self.slots {
            slot.forget();
            slot.shown = Shown::Unknown;

            let Some(channel) = slot.channel.as_mut() else {
                continue;
            };

            if self.connected {
                if let Err(e) = channel.clear().await {
                    debug!("Failed to clear {} on close: {}", slot.descriptor.display_name, e);
                }
            }
            if let Err(e) = channel.close().await {
                warn!("Failed to close {} channel: {}", slot.descriptor.display_name, e);
            }
        }

        self.connected = false;
        debug!("Closed presence channels");
    }

    /// Close and reconnect every channel
    pub async fn reconnect(&mut self) -> PresenceResult<()> {
        self.close().await;
        self.connect().await
    }
}

/// Outcome of a refused channel call; host-level faults are returned instead
fn slot_failure(
    err: PresenceError,
    descriptor: &'static SourceDescriptor,
) -> PresenceResult<SlotOutcome> {
    if err.requires_reconnect() {
        return Err(err);
    }
    warn!("Presence for {} not delivered: {}", descriptor.display_name, err);
    Ok(SlotOutcome::Failed {
        source: descriptor.key,
        error: err,
    })
}

/// `(start, end)` epoch milliseconds for a track `progress_ms` into playback
///
/// Saturates instead of overflowing on absurd positions.
pub fn playback_window(now_ms: i64, progress_ms: u64, duration_ms: u64) -> (i64, i64) {
    let progress = i64::try_from(progress_ms).unwrap_or(i64::MAX);
    let duration = i64::try_from(duration_ms).unwrap_or(i64::MAX);
    let start = now_ms.saturating_sub(progress);
    (start, start.saturating_add(duration))
}

/// Activity fields for a candidate under the display toggles
pub fn build_activity(
    candidate: &TrackWithSource,
    display: &DiscordConfig,
    timestamps: Option<(i64, i64)>,
) -> Activity {
    let track = &candidate.track;
    let mut activity = Activity {
        details: fit_text(track.name()),
        state: fit_text(track.artist()),
        large_image: track.image().unwrap_or(FALLBACK_LARGE_IMAGE).to_string(),
        large_text: track.album().map(fit_text),
        ..Activity::default()
    };

    if display.show_source_logo {
        activity.small_image = candidate.source_image.clone();
        activity.small_text = Some(fit_text(&format!("Listening on {}", candidate.source)));
    }

    if display.show_urls
        && let Some(url) = track.url()
    {
        activity.buttons.push(ActivityButton {
            label: truncate(&format!("Listen on {}", candidate.source), MAX_BUTTON_LABEL_LEN),
            url: url.to_string(),
        });
    }

    if display.show_ad {
        activity.buttons.push(ActivityButton {
            label: PROMO_LABEL.to_string(),
            url: PROMO_URL.to_string(),
        });
    }

    if display.show_progress
        && let Some((start, end)) = timestamps
    {
        activity.start_ms = Some(start);
        activity.end_ms = Some(end);
    }

    activity
}

/// Pad to [`MIN_TEXT_LEN`] and truncate to [`MAX_TEXT_LEN`] characters
pub fn fit_text(text: &str) -> String {
    let mut fitted = truncate(text, MAX_TEXT_LEN);
    let len = fitted.chars().count();
    if len < MIN_TEXT_LEN {
        fitted.extend(std::iter::repeat_n(' ', MIN_TEXT_LEN - len));
    }
    fitted
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl std::fmt::Debug for PresenceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceAggregator")
            .field("channels", &self.channel_count())
            .field("enabled", &self.enabled)
            .field("connected", &self.connected)
            .finish()
    }
}

/// Recovery for a failed channel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Close and reconnect every channel after the backoff
    Reconnect,
    /// Keep the channels and retry after the backoff
    Retry,
}

impl From<&PresenceError> for Recovery {
    fn from(err: &PresenceError) -> Self {
        if err.requires_reconnect() {
            Recovery::Reconnect
        } else {
            Recovery::Retry
        }
    }
}
