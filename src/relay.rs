// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrap and shutdown.
//!
//! [`Relay`] wires the checkpoint store, filter, writer and capture loop
//! together, runs the capture loop in its own task, and releases every store
//! handle when the run ends, whatever the reason.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> changefeed_relay::Result<()> {
//! use changefeed_relay::{Relay, RelayConfig, RunMode};
//!
//! let config = RelayConfig::from_json_file("relay.json")?;
//! let relay = Relay::from_config(&config).await?;
//!
//! let shutdown = relay.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.shutdown();
//! });
//!
//! let summary = relay.run(RunMode::from_config(&config.settings.run)?).await?;
//! println!("applied {} documents", summary.applied);
//! # Ok(())
//! # }
//! ```

use crate::capture::{CaptureLoop, CaptureState, CaptureSummary};
use crate::checkpoint::{CheckpointStore, SqliteCheckpointBackend};
use crate::config::{CheckpointBackendKind, RelayConfig, RelaySettings, RunConfig};
use crate::error::{RelayError, Result};
use crate::store::{ChangeFeedSource, CheckpointBackend, DocumentStore, RedisStore, StoreHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long a run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stop after the duration elapses.
    Bounded(Duration),
    /// Run until shutdown is requested.
    Unbounded,
}

impl RunMode {
    /// `run.duration` absent means unbounded.
    pub fn from_config(run: &RunConfig) -> Result<Self> {
        Ok(match run.duration()? {
            Some(d) => RunMode::Bounded(d),
            None => RunMode::Unbounded,
        })
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            RunMode::Bounded(d) => Some(*d),
            RunMode::Unbounded => None,
        }
    }
}

/// Requests a running relay to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the relay to drain and stop. Idempotent.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Store handles to release when the relay stops.
///
/// Released explicitly at the end of [`Relay::run`]. If dropped unreleased
/// (the run future was cancelled, or the relay never ran), it signals the
/// capture task to stop and schedules the release on the current runtime.
struct HandleGuard {
    handles: Vec<Arc<dyn StoreHandle>>,
    addrs: Vec<usize>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    released: bool,
}

impl HandleGuard {
    fn new(shutdown_tx: Arc<watch::Sender<bool>>) -> Self {
        Self {
            handles: Vec::new(),
            addrs: Vec::new(),
            shutdown_tx,
            released: false,
        }
    }

    /// Track a store, once per underlying instance.
    fn track<T: StoreHandle + ?Sized>(&mut self, store: &Arc<T>) {
        let addr = Arc::as_ptr(store).cast::<()>() as usize;
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
            self.handles.push(Arc::new(Arc::clone(store)));
        }
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_all(std::mem::take(&mut self.handles)).await;
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(stores = handles.len(), "Relay dropped before release, scheduling store release");
                runtime.spawn(release_all(handles));
            }
            Err(_) => {
                warn!(stores = handles.len(), "Relay dropped outside a runtime, stores not released");
            }
        }
    }
}

async fn release_all(handles: Vec<Arc<dyn StoreHandle>>) {
    for handle in handles {
        match handle.close().await {
            Ok(()) => debug!(store = %handle.name(), "Store released"),
            Err(e) => warn!(store = %handle.name(), error = %e, "Failed to release store"),
        }
    }
}

/// A configured relay for one direction of replication.
pub struct Relay<S, D, B>
where
    S: ChangeFeedSource + ?Sized,
    D: DocumentStore + ?Sized,
    B: CheckpointBackend + ?Sized,
{
    relay_id: String,
    capture: CaptureLoop<S, D, B>,
    guard: HandleGuard,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl<S, D, B> Relay<S, D, B>
where
    S: ChangeFeedSource + ?Sized,
    D: DocumentStore + ?Sized,
    B: CheckpointBackend + ?Sized,
{
    /// Wire a relay from already-open stores.
    ///
    /// The relay takes over releasing `source`, `destination` and
    /// `checkpoint_backend`; each distinct instance is closed once.
    pub fn new(
        relay_id: impl Into<String>,
        source: Arc<S>,
        destination: Arc<D>,
        checkpoint_backend: Arc<B>,
        marker: &str,
        settings: &RelaySettings,
    ) -> Result<Self> {
        let relay_id = relay_id.into();
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut guard = HandleGuard::new(Arc::clone(&shutdown_tx));
        guard.track(&source);
        guard.track(&destination);
        guard.track(&checkpoint_backend);

        // On error the guard drops here and schedules the release
        settings.validate()?;

        let checkpoints = CheckpointStore::with_id(checkpoint_backend, settings.checkpoint.id.clone())
            .with_retry(settings.checkpoint.save_retry.to_retry_config());

        let capture = CaptureLoop::new(
            relay_id.clone(),
            source,
            destination,
            checkpoints,
            marker,
            settings.capture.clone(),
        )?;

        Ok(Self {
            relay_id,
            capture,
            guard,
            shutdown_tx,
        })
    }

    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    /// Subscribe to capture state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<CaptureState> {
        self.capture.state_receiver()
    }

    /// Handle for requesting shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run the capture loop to completion, then release every store.
    ///
    /// A panic in the capture task is reported as
    /// [`RelayError::Internal`] after the stores are released.
    pub async fn run(self, mode: RunMode) -> Result<CaptureSummary> {
        let Relay {
            relay_id,
            capture,
            mut guard,
            shutdown_tx,
        } = self;

        info!(relay = %relay_id, mode = ?mode, "Relay starting");

        let task = tokio::spawn(capture.run(shutdown_tx.subscribe(), mode.duration()));

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(relay = %relay_id, error = %e, "Capture task panicked");
                Err(RelayError::Internal(format!("capture task panicked: {}", e)))
            }
            Err(e) => Err(RelayError::Internal(format!("capture task cancelled: {}", e))),
        };

        guard.release().await;

        match &result {
            Ok(summary) => info!(
                relay = %relay_id,
                stop_reason = %summary.stop_reason,
                applied = summary.applied,
                skipped = summary.skipped,
                failed = summary.failed,
                "Relay stopped"
            ),
            Err(e) => error!(relay = %relay_id, error = %e, "Relay stopped with error"),
        }
        result
    }
}

impl Relay<RedisStore, RedisStore, dyn CheckpointBackend> {
    /// Connect the configured stores and wire a relay.
    ///
    /// Stores opened before a failure are released before returning.
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        config.validate()?;

        let source = Arc::new(RedisStore::connect(config.source.clone()).await?);

        let destination = match RedisStore::connect(config.destination.clone()).await {
            Ok(destination) => Arc::new(destination),
            Err(e) => {
                release_all(vec![source as Arc<dyn StoreHandle>]).await;
                return Err(e);
            }
        };

        let checkpoint_backend: Arc<dyn CheckpointBackend> = match config.settings.checkpoint.backend {
            CheckpointBackendKind::Destination => Arc::clone(&destination) as Arc<dyn CheckpointBackend>,
            CheckpointBackendKind::Sqlite => {
                match SqliteCheckpointBackend::open(&config.settings.checkpoint.sqlite_path).await {
                    Ok(backend) => Arc::new(backend),
                    Err(e) => {
                        release_all(vec![source as Arc<dyn StoreHandle>, destination as Arc<dyn StoreHandle>]).await;
                        return Err(e);
                    }
                }
            }
        };

        Self::new(
            config.relay_id.clone(),
            source,
            destination,
            checkpoint_backend,
            &config.sync_source,
            &config.settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StopReason;
    use crate::store::MemoryStore;

    fn memory_relay(
        source: &Arc<MemoryStore>,
        dest: &Arc<MemoryStore>,
    ) -> Relay<MemoryStore, MemoryStore, MemoryStore> {
        Relay::new(
            "test",
            Arc::clone(source),
            Arc::clone(dest),
            Arc::clone(dest),
            "marker-a",
            &RelaySettings::for_testing(),
        )
        .unwrap()
    }

    #[test]
    fn test_run_mode_from_config() {
        let bounded = RunConfig {
            duration: Some("30s".to_string()),
        };
        assert_eq!(
            RunMode::from_config(&bounded).unwrap(),
            RunMode::Bounded(Duration::from_secs(30))
        );
        assert_eq!(RunMode::from_config(&RunConfig::default()).unwrap(), RunMode::Unbounded);

        let bad = RunConfig {
            duration: Some("whenever".to_string()),
        };
        assert!(RunMode::from_config(&bad).is_err());
    }

    #[test]
    fn test_shutdown_handle_clones_share_state() {
        let (tx, _) = watch::channel(false);
        let handle = ShutdownHandle { tx: Arc::new(tx) };
        let other = handle.clone();
        assert!(!other.is_shutdown());
        handle.shutdown();
        handle.shutdown();
        assert!(other.is_shutdown());
    }

    #[tokio::test]
    async fn test_bounded_run_releases_each_store_once() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));

        let summary = memory_relay(&source, &dest)
            .run(RunMode::Bounded(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Timer);
        assert!(source.is_closed());
        assert!(dest.is_closed());
        // Destination doubles as checkpoint backend but is closed once
        assert_eq!(dest.close_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_unbounded_run() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        let relay = memory_relay(&source, &dest);
        let shutdown = relay.shutdown_handle();
        let mut state_rx = relay.state_receiver();

        let run = tokio::spawn(relay.run(RunMode::Unbounded));
        while *state_rx.borrow_and_update() != CaptureState::Streaming {
            state_rx.changed().await.unwrap();
        }
        shutdown.shutdown();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_failed_start_still_releases() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        source.set_unreachable(true);

        let err = memory_relay(&source, &dest)
            .run(RunMode::Unbounded)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
        assert!(source.is_closed());
        assert!(dest.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_relay_schedules_release() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        drop(memory_relay(&source, &dest));

        for _ in 0..50 {
            if source.is_closed() && dest.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.is_closed());
        assert!(dest.is_closed());
    }

    #[tokio::test]
    async fn test_blank_marker_rejected_and_released() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        let result = Relay::new(
            "test",
            Arc::clone(&source),
            Arc::clone(&dest),
            Arc::clone(&dest),
            " ",
            &RelaySettings::for_testing(),
        );
        assert!(matches!(result, Err(RelayError::Config(_))));

        for _ in 0..50 {
            if source.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_zero_progress_interval_rejected_before_run() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        let mut settings = RelaySettings::for_testing();
        settings.capture.progress_interval = "0s".to_string();

        let result = Relay::new(
            "test",
            Arc::clone(&source),
            Arc::clone(&dest),
            Arc::clone(&dest),
            "marker-a",
            &settings,
        );
        assert!(matches!(result, Err(RelayError::Config(ref msg)) if msg.contains("progress_interval")));

        for _ in 0..50 {
            if source.is_closed() && dest.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.is_closed());
        assert!(dest.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_checkpoint_settings_rejected() {
        let source = Arc::new(MemoryStore::new("src"));
        let dest = Arc::new(MemoryStore::new("dst"));
        let mut settings = RelaySettings::for_testing();
        settings.checkpoint.save_retry.max_attempts = 0;

        let result = Relay::new(
            "test",
            Arc::clone(&source),
            Arc::clone(&dest),
            Arc::clone(&dest),
            "marker-a",
            &settings,
        );
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
