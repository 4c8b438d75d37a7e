//! Source poller
//!
//! A [`SourcePoller`] repeatedly asks one [`SourceAdapter`] for the current
//! track on its own task and publishes the result as a [`Snapshot`].
//!
//! ## Snapshot Cell
//!
//! The snapshot is held in a `tokio::sync::watch` channel. Every update
//! replaces the whole `(track, captured_at)` value, so readers can never
//! observe a track paired with a timestamp from a different poll.
//!
//! ## Failure Isolation
//!
//! Adapter errors are logged and followed by a constant backoff. They never
//! leave the poller; the snapshot simply ages until it falls outside the
//! freshness window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::SourceDescriptor;
use crate::track::{Track, TrackWithSource};
use crate::traits::SourceAdapter;

/// Multiple of the update gap after which a snapshot counts as stopped
pub const FRESHNESS_FACTOR: u32 = 3;

/// Latest result of a poller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Track reported by the last successful poll
    pub track: Option<Track>,
    /// When the last successful poll completed
    pub captured_at: Option<Instant>,
}

impl Snapshot {
    /// Whether the snapshot was captured within `window` of `now`
    pub fn is_fresh(&self, window: Duration, now: Instant) -> bool {
        self.captured_at
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}

/// Background polling loop for one source
pub struct SourcePoller {
    adapter: Arc<dyn SourceAdapter>,
    update_gap: Duration,
    error_backoff: Duration,
    snapshot: watch::Sender<Snapshot>,
}

impl SourcePoller {
    /// Create a poller
    ///
    /// # Parameters
    ///
    /// - `adapter`: the source to poll
    /// - `update_gap`: delay between successful polls
    /// - `error_backoff`: delay after a failed poll
    pub fn new(adapter: Box<dyn SourceAdapter>, update_gap: Duration, error_backoff: Duration) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());

        Self {
            adapter: Arc::from(adapter),
            update_gap,
            error_backoff,
            snapshot,
        }
    }

    /// Window after which this poller's snapshot is treated as stopped
    pub fn freshness_window(&self) -> Duration {
        self.update_gap * FRESHNESS_FACTOR
    }

    /// Receiver for the snapshot cell
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Run the polling loop until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.adapter.source_name();
        info!("Starting {} poller (interval={:?})", name, self.update_gap);

        loop {
            let delay = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.adapter.get_current_track() => match result {
                    Ok(track) => {
                        debug!("{} poll: {:?}", name, track.as_ref().map(Track::name));
                        self.snapshot.send_replace(Snapshot {
                            track,
                            captured_at: Some(Instant::now()),
                        });
                        self.update_gap
                    }
                    Err(e) => {
                        warn!("Failed to fetch {} track: {}", name, e);
                        self.error_backoff
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("{} poller stopped", name);
    }

    /// Spawn the polling loop on its own task
    ///
    /// The returned handle stops the task through a child of `parent`, so
    /// cancelling `parent` stops every poller spawned from it.
    pub fn spawn(self, parent: &CancellationToken) -> PollerHandle {
        let cancel = parent.child_token();
        let descriptor = self.adapter.descriptor();
        let freshness_window = self.freshness_window();
        let snapshot = self.subscribe();
        let task = tokio::spawn(self.run(cancel.clone()));

        PollerHandle {
            descriptor,
            freshness_window,
            snapshot,
            cancel,
            task,
        }
    }
}

/// Handle to a running poller
pub struct PollerHandle {
    descriptor: &'static SourceDescriptor,
    freshness_window: Duration,
    snapshot: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn descriptor(&self) -> &'static SourceDescriptor {
        self.descriptor
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// The polled track, if one is playing and the snapshot is fresh
    pub fn current_track(&self, now: Instant) -> Option<TrackWithSource> {
        let snapshot = self.snapshot();

        if !snapshot.is_fresh(self.freshness_window, now) {
            return None;
        }

        snapshot.track.map(|track| {
            TrackWithSource::new(
                track,
                self.descriptor.display_name,
                Some(self.descriptor.logo_url.to_string()),
            )
        })
    }

    /// Signal the loop to exit; it does so at its next wake-up
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the polling task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for the task to exit
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!("{} poller task failed: {}", self.descriptor.display_name, e);
        }
    }
}
