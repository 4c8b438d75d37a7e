//! Contract Test: Progress Debounce and Timer Reconstruction
//!
//! Constraints verified:
//! - start = now - progress_ms, end = start + duration_ms
//! - An unchanged progress_ms causes no publish call
//! - A new (name, artist, album, source) forgets the remembered progress
//! - Only the playing source is published; absent sources get no update

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio_util::sync::CancellationToken;
use tunecast_core::aggregator::{PresenceAggregator, SlotOutcome};
use tunecast_core::catalog;
use tunecast_core::registry::AdapterRegistry;
use tunecast_core::supervisor::{Supervisor, SupervisorEvent};
use tunecast_core::track::{Track, TrackWithSource};

fn spotify(track: Track) -> TrackWithSource {
    TrackWithSource::new(track, "Spotify", Some(catalog::SPOTIFY.logo_url.to_string()))
}

async fn connected_aggregator() -> (PresenceAggregator, ChannelLog) {
    let config = config_with_source("spotify", 1000);
    let (factory, log) = RecordingChannelFactory::new();
    let mut aggregator = PresenceAggregator::new(&config, Arc::new(factory));
    aggregator.connect().await.unwrap();
    (aggregator, log)
}

#[tokio::test]
async fn timestamps_are_rebuilt_from_progress() {
    let (mut aggregator, log) = connected_aggregator().await;
    let track = spotify(Track::new("A", "B").with_progress(5_000, 200_000));

    aggregator.update(&[track], 1_000_000).await.unwrap();

    let updates = log.updates_for("spotify");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].start_ms, Some(995_000));
    assert_eq!(updates[0].end_ms, Some(1_195_000));
}

#[tokio::test]
async fn unchanged_progress_is_not_republished() {
    let (mut aggregator, log) = connected_aggregator().await;
    let track = spotify(Track::new("A", "B").with_progress(10_000, 200_000));

    aggregator.update(&[track.clone()], 1_000_000).await.unwrap();
    let outcomes = aggregator.update(&[track], 1_001_000).await.unwrap();

    assert_eq!(log.updates_for("spotify").len(), 1);
    assert!(outcomes.contains(&SlotOutcome::Skipped { source: "spotify" }));

    // Advancing progress republishes
    let advanced = spotify(Track::new("A", "B").with_progress(11_000, 200_000));
    aggregator.update(&[advanced], 1_001_000).await.unwrap();
    assert_eq!(log.updates_for("spotify").len(), 2);
}

#[tokio::test]
async fn identity_change_resets_progress() {
    let (mut aggregator, log) = connected_aggregator().await;
    let first = spotify(Track::new("A", "B").with_album("X").with_progress(0, 200_000));
    aggregator.update(&[first], 1_000_000).await.unwrap();

    // Same progress, different album: a different track
    let second = spotify(Track::new("A", "B").with_album("Y").with_progress(0, 180_000));
    aggregator.update(&[second], 1_001_000).await.unwrap();

    let updates = log.updates_for("spotify");
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].large_text.as_deref(), Some("Y "));
    assert_eq!(updates[1].end_ms, Some(1_181_000));
}

#[tokio::test]
async fn polled_tracks_win_over_relayed_ones() {
    let (mut aggregator, log) = connected_aggregator().await;
    let polled = spotify(Track::new("Polled", "B"));
    let relayed = spotify(Track::new("Relayed", "B"));

    aggregator.update(&[polled, relayed], 1_000_000).await.unwrap();

    assert_eq!(log.updates_for("spotify")[0].details, "Polled");
}

#[tokio::test]
async fn spotify_scenario_publishes_once() {
    let adapters = Arc::new(AdapterRegistry::new());
    let (factory, handle) = ControlledAdapterFactory::new(&catalog::SPOTIFY);
    handle.set_track(Some(Track::new("A", "B").with_progress(10_000, 200_000)));
    adapters.register_adapter("spotify", Box::new(factory));

    let config = config_with_source("spotify", 1000);
    let (channels, log) = RecordingChannelFactory::new();
    let loader = SwappableConfigLoader::new(config.clone());
    let (config_tx, _config_rx) = tokio::sync::watch::channel(config);

    let (supervisor, mut events) =
        Supervisor::new(Arc::new(loader), adapters, Arc::new(channels), config_tx);

    let cancel = CancellationToken::new();
    let t0 = chrono::Utc::now().timestamp_millis();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { supervisor.run(cancel).await }
    });

    wait_until(Duration::from_secs(3), || !log.updates_for("spotify").is_empty()).await;
    // Several more ticks with the same progress
    tokio::time::sleep(Duration::from_millis(150)).await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    let updates = log.updates_for("spotify");
    assert_eq!(updates.len(), 1, "unchanged progress must not republish");

    let start = updates[0].start_ms.unwrap();
    assert!((start - (t0 - 10_000)).abs() < 1_000, "start ≈ t0 - 10s, got {}", start);
    assert_eq!(updates[0].end_ms, Some(start + 200_000));

    assert_eq!(log.update_count(), 1, "no update for absent sources");

    let mut published = 0;
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::Published { source, .. } = event {
            assert_eq!(source, "spotify");
            published += 1;
        }
    }
    assert_eq!(published, 1);
}
