//! Contract Test: Freshness Window
//!
//! Constraints verified:
//! - A poller snapshot older than `update_gap × 3` is excluded
//! - Failing adapters age out instead of leaking an old track
//! - Every fresh source is reported, not a single winner
//! - Stopping the registry joins every poller task

mod common;

use std::time::Duration;

use common::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tunecast_core::catalog;
use tunecast_core::registry::{AdapterRegistry, SourceRegistry};
use tunecast_core::track::Track;

#[tokio::test]
async fn stale_snapshot_is_excluded() {
    let adapters = AdapterRegistry::new();
    let (factory, handle) = ControlledAdapterFactory::new(&catalog::PLEX);
    handle.set_track(Some(Track::new("Song", "Artist")));
    adapters.register_adapter("plex", Box::new(factory));

    let config = config_with_source("plex", 50);
    let root = CancellationToken::new();
    let mut registry = SourceRegistry::start(&config, &adapters, &root);

    wait_until(Duration::from_secs(2), || !registry.get_current_tracks().is_empty()).await;

    let now = Instant::now();
    assert_eq!(registry.tracks_at(now).len(), 1);
    assert!(
        registry.tracks_at(now + Duration::from_millis(151)).is_empty(),
        "a snapshot older than 3 × 50ms must be excluded"
    );

    registry.stop().await;
}

#[tokio::test]
async fn failing_adapter_ages_out() {
    let adapters = AdapterRegistry::new();
    let (factory, handle) = ControlledAdapterFactory::new(&catalog::PLEX);
    handle.set_track(Some(Track::new("Song", "Artist")));
    adapters.register_adapter("plex", Box::new(factory));

    let config = config_with_source("plex", 20);
    let root = CancellationToken::new();
    let mut registry = SourceRegistry::start(&config, &adapters, &root);

    wait_until(Duration::from_secs(2), || !registry.get_current_tracks().is_empty()).await;

    handle.set_failing(true);
    wait_until(Duration::from_secs(2), || registry.get_current_tracks().is_empty()).await;
    let calls = handle.call_count();

    // Recovery is a plain constant backoff
    handle.set_failing(false);
    wait_until(Duration::from_secs(2), || !registry.get_current_tracks().is_empty()).await;
    assert!(handle.call_count() > calls);

    registry.stop().await;
}

#[tokio::test]
async fn every_fresh_source_is_reported() {
    let adapters = AdapterRegistry::new();
    let (plex, plex_handle) = ControlledAdapterFactory::new(&catalog::PLEX);
    let (lastfm, lastfm_handle) = ControlledAdapterFactory::new(&catalog::LASTFM);
    plex_handle.set_track(Some(Track::new("Plex Song", "Artist")));
    lastfm_handle.set_track(Some(Track::new("Scrobbled Song", "Artist")));
    adapters.register_adapter("plex", Box::new(plex));
    adapters.register_adapter("lastfm", Box::new(lastfm));

    let config = config_with_source("plex", 20).with_source(
        "lastfm",
        tunecast_core::SourceConfig::enabled().with_update_gap_ms(20),
    );
    let root = CancellationToken::new();
    let mut registry = SourceRegistry::start(&config, &adapters, &root);

    wait_until(Duration::from_secs(2), || registry.get_current_tracks().len() == 2).await;

    let sources: Vec<String> = registry
        .get_current_tracks()
        .into_iter()
        .map(|t| t.source)
        .collect();
    assert_eq!(sources, vec!["Last.fm", "Plex"]);

    // Nothing playing is not the same as stale: the source simply drops out
    plex_handle.set_track(None);
    wait_until(Duration::from_secs(2), || registry.get_current_tracks().len() == 1).await;

    registry.stop().await;
}

#[tokio::test]
async fn stop_joins_every_poller() {
    let adapters = AdapterRegistry::new();
    let (factory, handle) = ControlledAdapterFactory::new(&catalog::PLEX);
    adapters.register_adapter("plex", Box::new(factory));

    let config = config_with_source("plex", 10);
    let root = CancellationToken::new();
    let mut registry = SourceRegistry::start(&config, &adapters, &root);

    wait_until(Duration::from_secs(2), || handle.call_count() > 0).await;
    registry.stop().await;

    let calls = handle.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.call_count(), calls, "no poll after stop()");
    assert!(registry.is_empty());
}
