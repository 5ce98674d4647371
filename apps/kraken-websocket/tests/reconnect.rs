//! Reconnect Integration Tests
//!
//! Checks the default schedule and the stability reset on a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kraken_websocket::{ConnectionEngine, EngineConfig, MemoryTransport};

const TOLERANCE: Duration = Duration::from_millis(50);

fn assert_gaps(opened: &[Instant], expected: &[u64]) {
    let gaps: Vec<Duration> = opened.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), expected.len(), "gaps: {gaps:?}");
    for (gap, secs) in gaps.iter().zip(expected) {
        let want = Duration::from_secs(*secs);
        let diff = if *gap > want { *gap - want } else { want - *gap };
        assert!(diff <= TOLERANCE, "expected {want:?}, got {gap:?} in {gaps:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn failing_connections_follow_kraken_schedule() {
    let (transport, mut peers) = MemoryTransport::new();
    let engine = Arc::new(ConnectionEngine::new(
        EngineConfig::public().with_url("memory://public"),
        Arc::new(transport),
        None,
        CancellationToken::new(),
    ));
    tokio::spawn(Arc::clone(&engine).run());

    let mut opened = Vec::new();

    // Every connection fails at once, so the schedule never restarts.
    for _ in 0..8 {
        let peer = peers.recv().await.unwrap();
        opened.push(Instant::now());
        peer.fail("reset by peer");
    }

    assert_gaps(&opened, &[0, 0, 1, 5, 5, 5, 5]);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stable_connection_resets_backoff() {
    let (transport, mut peers) = MemoryTransport::new();
    let engine = Arc::new(ConnectionEngine::new(
        EngineConfig::public().with_url("memory://public"),
        Arc::new(transport),
        None,
        CancellationToken::new(),
    ));
    tokio::spawn(Arc::clone(&engine).run());

    let mut opened = Vec::new();

    for _ in 0..4 {
        let peer = peers.recv().await.unwrap();
        opened.push(Instant::now());
        peer.fail("reset by peer");
    }

    // Held past the stability window.
    let peer = peers.recv().await.unwrap();
    opened.push(Instant::now());
    tokio::time::sleep(Duration::from_secs(6)).await;
    peer.fail("reset by peer");

    for _ in 0..3 {
        let peer = peers.recv().await.unwrap();
        opened.push(Instant::now());
        peer.fail("reset by peer");
    }

    assert_gaps(&opened, &[0, 0, 1, 5, 6, 0, 0, 1]);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn handle_stream_follows_reconnects() {
    let (transport, mut peers) = MemoryTransport::new();
    let engine = Arc::new(ConnectionEngine::new(
        EngineConfig::public().with_url("memory://public"),
        Arc::new(transport),
        None,
        CancellationToken::new(),
    ));
    let mut handles = engine.handles();
    tokio::spawn(Arc::clone(&engine).run());

    let first_peer = peers.recv().await.unwrap();
    let first = handles.next().await.unwrap();
    assert!(!first.is_closed());

    first_peer.close(Some(1006), "abnormal");
    let _second_peer = peers.recv().await.unwrap();
    let second = handles.next().await.unwrap();

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_ne!(first.id(), second.id());

    engine.shutdown();
}
