// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory relay fixtures.
//!
//! Relays here run against [`MemoryStore`]s, so scenarios that need restarts,
//! faults or two directions run without Docker.

#![allow(dead_code)]

use changefeed_relay::checkpoint::DEFAULT_CHECKPOINT_ID;
use changefeed_relay::config::RelaySettings;
use changefeed_relay::{
    CaptureState, CaptureSummary, Document, MemoryStore, Position, Relay, Result, RunMode,
    ShutdownHandle,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const LEGACY_MARKER: &str = "legacy-changestream";
pub const ATLAS_MARKER: &str = "atlas-changestream";

pub type MemoryRelay = Relay<MemoryStore, MemoryStore, MemoryStore>;

/// `{_id: id, value: value}`
pub fn doc(id: &str, value: i64) -> Document {
    Document::from_value(json!({"_id": id, "value": value})).unwrap()
}

/// Relay from `source` to `dest`, keeping its checkpoint in `dest`.
///
/// The relay gets its own handles, so `source` and `dest` stay open after
/// it releases them and can be handed to the next relay.
pub fn memory_relay(source: &MemoryStore, dest: &MemoryStore, marker: &str) -> MemoryRelay {
    let dest = Arc::new(dest.new_handle());
    Relay::new(
        format!("{}-relay", marker),
        Arc::new(source.new_handle()),
        Arc::clone(&dest),
        dest,
        marker,
        &RelaySettings::for_testing(),
    )
    .unwrap()
}

/// Relay over the given handles themselves, so tests can observe release.
pub fn owning_relay(source: &Arc<MemoryStore>, dest: &Arc<MemoryStore>, marker: &str) -> MemoryRelay {
    Relay::new(
        format!("{}-relay", marker),
        Arc::clone(source),
        Arc::clone(dest),
        Arc::clone(dest),
        marker,
        &RelaySettings::for_testing(),
    )
    .unwrap()
}

/// A relay running in the background.
pub struct RunningRelay {
    handle: JoinHandle<Result<CaptureSummary>>,
    shutdown: ShutdownHandle,
}

impl RunningRelay {
    /// Request shutdown and wait for the summary.
    pub async fn stop(self) -> Result<CaptureSummary> {
        self.shutdown.shutdown();
        self.join().await
    }

    /// Wait for the run to end on its own.
    pub async fn join(self) -> Result<CaptureSummary> {
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("relay did not stop in time")
            .expect("relay task panicked")
    }
}

/// Spawn an unbounded run and wait until it is streaming (or closed).
pub async fn start(relay: MemoryRelay) -> RunningRelay {
    let shutdown = relay.shutdown_handle();
    let mut state_rx = relay.state_receiver();
    let handle = tokio::spawn(relay.run(RunMode::Unbounded));

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = *state_rx.borrow_and_update();
            if state == CaptureState::Streaming || state == CaptureState::Closed {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    RunningRelay { handle, shutdown }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a document to show up in `store`.
pub async fn wait_for_document(store: &MemoryStore, key: &str) -> Option<Document> {
    eventually(Duration::from_secs(5), || async { store.document(key).await.is_some() }).await;
    store.document(key).await
}

/// Wait until the default checkpoint in `store` equals `position`.
pub async fn wait_for_checkpoint(store: &MemoryStore, position: &Position) -> bool {
    eventually(Duration::from_secs(5), || async {
        store.checkpoint(DEFAULT_CHECKPOINT_ID).await.as_ref() == Some(position)
    })
    .await
}
