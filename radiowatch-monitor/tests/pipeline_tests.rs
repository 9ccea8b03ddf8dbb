//! End-to-end pipeline tests
//!
//! Each test runs the real orchestrator against an in-process stream stub
//! and an in-memory database, observing pipeline milestones through the
//! event bus. External recognition providers are disabled so the cascade is
//! exactly the local store.

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use helpers::*;
use radiowatch_common::events::{EventBus, MonitorEvent, StationHealth};
use radiowatch_monitor::analysis::decode_sample;
use radiowatch_monitor::db::stations::{self, Station};
use radiowatch_monitor::db::stats::StatsKey;
use radiowatch_monitor::db::tracks::{self, Track, TrackMetadata};
use radiowatch_monitor::db::{self, detections, stats};
use radiowatch_monitor::recognition::{AudioSample, RecognizedTrack};
use radiowatch_monitor::session::MIN_PLAY_SECONDS;
use radiowatch_monitor::{MonitorConfig, StationOrchestrator};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn test_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_seconds: 1,
        fetch_timeout_seconds: 5,
        audio_id_api_key: None,
        metadata_id_enabled: false,
        recompute_interval_hours: 0,
        ..MonitorConfig::default()
    }
}

/// Register a track whose fingerprint matches the given capture, so the
/// local store recognizes it
async fn register_track(pool: &SqlitePool, capture: &[u8]) -> Track {
    let audio = decode_sample(capture.to_vec(), Some("audio/wav")).unwrap();
    let sample = AudioSample::prepare(capture.to_vec(), audio).await.unwrap();
    tracks::create_or_update_track(
        pool,
        &TrackMetadata {
            title: "Harbor Lights".to_string(),
            artist: "Delta Quay".to_string(),
            ..Default::default()
        },
        Some(sample.fingerprint.as_str()),
    )
    .await
    .unwrap()
}

async fn wait_for<F>(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    seconds: u64,
    matches: F,
) -> MonitorEvent
where
    F: Fn(&MonitorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(seconds), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_known_music_creates_one_detection_with_local_source() {
    // Given a station streaming audio whose fingerprint is already known
    let pool = db::init_memory_pool().await.unwrap();
    let stub = StubStream::start(music_wav(), Duration::ZERO).await;
    let station = Station::new("KTST".to_string(), stub.url());
    stations::save_station(&pool, &station).await.unwrap();
    let track = register_track(&pool, &music_wav()).await;

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let orchestrator =
        StationOrchestrator::new(pool.clone(), test_config(), events, cancel.clone()).unwrap();
    let run = tokio::spawn(orchestrator.run());

    // When the first cycle runs, a session opens with a local match
    let opened = wait_for(&mut rx, 10, |e| {
        matches!(e, MonitorEvent::SessionOpened { .. })
    })
    .await;
    match opened {
        MonitorEvent::SessionOpened {
            track_id,
            confidence,
            source,
            ..
        } => {
            assert_eq!(track_id, track.id);
            assert!((confidence - 100.0).abs() < f64::EPSILON);
            assert_eq!(source, "local");
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    // And the stream turns to silence before the next cycle
    stub.set_payload(silence_wav()).await;

    // Then the session finalizes into exactly one detection
    let finalized = wait_for(&mut rx, 10, |e| {
        matches!(e, MonitorEvent::DetectionFinalized { .. })
    })
    .await;
    match finalized {
        MonitorEvent::DetectionFinalized {
            track_id,
            duration_seconds,
            confidence,
            ..
        } => {
            assert_eq!(track_id, track.id);
            assert_eq!(duration_seconds, MIN_PLAY_SECONDS);
            assert!((confidence - 100.0).abs() < f64::EPSILON);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    let timeline = detections::detections_for_station(&pool, station.id)
        .await
        .unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].source, "local");

    let row = stats::load_stats(&pool, StatsKey::Track(track.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.count, 1);
    assert!((row.average_confidence - 100.0).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_music_creates_no_sessions_or_detections() {
    // Given a station streaming silence
    let pool = db::init_memory_pool().await.unwrap();
    let stub = StubStream::start(silence_wav(), Duration::ZERO).await;
    let station = Station::new("KTLK".to_string(), stub.url());
    stations::save_station(&pool, &station).await.unwrap();

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let orchestrator =
        StationOrchestrator::new(pool.clone(), test_config(), events, cancel.clone()).unwrap();
    let run = tokio::spawn(orchestrator.run());

    // When two cycles complete successfully
    for _ in 0..2 {
        let event = wait_for(&mut rx, 10, |e| {
            matches!(e, MonitorEvent::StationCycleCompleted { .. })
        })
        .await;
        match event {
            MonitorEvent::StationCycleCompleted { success, .. } => assert!(success),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    // Then nothing downstream of the gate ran
    let timeline = detections::detections_for_station(&pool, station.id)
        .await
        .unwrap();
    assert!(timeline.is_empty());
    let reloaded = stations::load_station(&pool, station.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.health, StationHealth::Good);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_music_reports_unidentified_and_opens_no_session() {
    // Given a station streaming music whose fingerprint is not on record
    let pool = db::init_memory_pool().await.unwrap();
    let stub = StubStream::start(music_wav(), Duration::ZERO).await;
    let station = Station::new("KUNK".to_string(), stub.url());
    stations::save_station(&pool, &station).await.unwrap();

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let orchestrator =
        StationOrchestrator::new(pool.clone(), test_config(), events, cancel.clone()).unwrap();
    let run = tokio::spawn(orchestrator.clone().run());

    // When a cycle gates the sample as music but the cascade has no answer
    let event = wait_for(&mut rx, 10, |e| {
        matches!(e, MonitorEvent::MusicUnidentified { .. })
    })
    .await;
    match event {
        MonitorEvent::MusicUnidentified {
            station_id,
            likelihood,
            ..
        } => {
            assert_eq!(station_id, station.id);
            assert!(likelihood >= 30.0);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    // Then no session opened and no detection exists
    assert_eq!(orchestrator.tracker().open_session_count().await, 0);
    let timeline = detections::detections_for_station(&pool, station.id)
        .await
        .unwrap();
    assert!(timeline.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_failure_finalizes_session_and_degrades_station() {
    // Given a station whose stream is unreachable and a session opened from
    // earlier cycles
    let pool = db::init_memory_pool().await.unwrap();
    let station = Station::new("KGNE".to_string(), "http://127.0.0.1:1/stream".to_string());
    stations::save_station(&pool, &station).await.unwrap();
    let track = register_track(&pool, &music_wav()).await;

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let orchestrator =
        StationOrchestrator::new(pool.clone(), test_config(), events, cancel.clone()).unwrap();

    let matched = RecognizedTrack {
        track_id: track.id,
        confidence: 100.0,
        source: "local",
    };
    let now = Utc::now();
    orchestrator
        .tracker()
        .observe(station.id, Some(&matched), now - ChronoDuration::seconds(90))
        .await
        .unwrap();
    orchestrator
        .tracker()
        .observe(station.id, Some(&matched), now - ChronoDuration::seconds(30))
        .await
        .unwrap();

    let run = tokio::spawn(orchestrator.clone().run());

    // When the cycle exhausts its fetch retries
    let finalized = wait_for(&mut rx, 20, |e| {
        matches!(e, MonitorEvent::DetectionFinalized { .. })
    })
    .await;
    match finalized {
        MonitorEvent::DetectionFinalized {
            track_id,
            duration_seconds,
            ..
        } => {
            assert_eq!(track_id, track.id);
            // 90s session start to 30s-ago extend
            assert_eq!(duration_seconds, 60);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    let health_changed = wait_for(&mut rx, 20, |e| {
        matches!(e, MonitorEvent::StationHealthChanged { .. })
    })
    .await;
    match health_changed {
        MonitorEvent::StationHealthChanged { health, .. } => {
            assert_eq!(health, StationHealth::Degraded);
        }
        other => panic!("Unexpected event: {:?}", other),
    }
    wait_for(&mut rx, 20, |e| {
        matches!(
            e,
            MonitorEvent::StationCycleCompleted { success: false, .. }
        )
    })
    .await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    // Then the station is marked degraded and no session remains open
    let reloaded = stations::load_station(&pool, station.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.health, StationHealth::Degraded);
    assert_eq!(orchestrator.tracker().open_session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degraded_station_recovers_after_successful_cycle() {
    // Given a station previously marked degraded whose stream is back
    let pool = db::init_memory_pool().await.unwrap();
    let stub = StubStream::start(music_wav(), Duration::ZERO).await;
    let mut station = Station::new("KBAK".to_string(), stub.url());
    station.health = StationHealth::Degraded;
    stations::save_station(&pool, &station).await.unwrap();
    register_track(&pool, &music_wav()).await;

    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let orchestrator =
        StationOrchestrator::new(pool.clone(), test_config(), events, cancel.clone()).unwrap();
    let run = tokio::spawn(orchestrator.run());

    // When a cycle probes it and completes
    let health_changed = wait_for(&mut rx, 15, |e| {
        matches!(e, MonitorEvent::StationHealthChanged { .. })
    })
    .await;
    match health_changed {
        MonitorEvent::StationHealthChanged { health, .. } => {
            assert_eq!(health, StationHealth::Good);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    let reloaded = stations::load_station(&pool, station.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.health, StationHealth::Good);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fifteen_stations_respect_concurrency_cap() {
    // Given 15 active stations behind one slow stream endpoint
    let pool = db::init_memory_pool().await.unwrap();
    let stub = StubStream::start(silence_wav(), Duration::from_millis(500)).await;
    for i in 0..15 {
        let station = Station::new(format!("KST{:02}", i), stub.url());
        stations::save_station(&pool, &station).await.unwrap();
    }

    let events = EventBus::new(256);
    let mut rx = events.subscribe();
    let cancel = CancellationToken::new();
    let config = test_config();
    assert_eq!(config.station_concurrency, 10);
    let orchestrator =
        StationOrchestrator::new(pool.clone(), config, events, cancel.clone()).unwrap();
    let run = tokio::spawn(orchestrator.run());

    // When every station completes one cycle
    for _ in 0..15 {
        wait_for(&mut rx, 30, |e| {
            matches!(e, MonitorEvent::StationCycleCompleted { .. })
        })
        .await;
    }

    cancel.cancel();
    run.await.unwrap().unwrap();

    // Then the worker pool never exceeded its cap
    assert!(
        stub.max_concurrent() <= 10,
        "peak concurrent fetches {} exceeded cap",
        stub.max_concurrent()
    );
}
