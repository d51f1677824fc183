// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capture loop.
//!
//! Consumes the filtered change feed and drives each event through the
//! idempotent writer, checkpointing strictly after a successful apply.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  next_event   ┌───────────┐  bounded mpsc  ┌─────────────┐
//! │ FeedHandle   │ ────────────► │ pump task │ ─────────────► │ apply loop  │
//! │ (filtered)   │               └───────────┘                │ apply, then │
//! └──────────────┘                                            │ checkpoint  │
//!                                                             └─────────────┘
//! ```
//!
//! The pump owns the feed handle and closes it when stopped. The apply loop
//! processes one event at a time; buffered events that were never applied
//! are never checkpointed, so they are redelivered after a restart.
//!
//! # Checkpoint hold
//!
//! When an apply fails (after in-place retries for connection errors) the
//! checkpoint stays at the last contiguously applied position for the rest
//! of the run. Later events are still applied but not checkpointed.

mod types;

pub use types::{CaptureState, CaptureSummary, StopReason};

use crate::checkpoint::CheckpointStore;
use crate::config::CaptureConfig;
use crate::error::{RelayError, Result};
use crate::feed::{ChangeEvent, OperationKind, Position};
use crate::filter::FeedFilter;
use crate::metrics;
use crate::resilience::{retry, RetryConfig};
use crate::store::{ChangeFeedSource, CheckpointBackend, DocumentStore, FeedHandle};
use crate::writer::IdempotentWriter;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One capture run over a source feed.
pub struct CaptureLoop<S, D, B>
where
    S: ChangeFeedSource + ?Sized,
    D: DocumentStore + ?Sized,
    B: CheckpointBackend + ?Sized,
{
    relay_id: String,
    source: Arc<S>,
    writer: IdempotentWriter<D>,
    checkpoints: CheckpointStore<B>,
    filter: FeedFilter,
    config: CaptureConfig,
    apply_retry: RetryConfig,
    state_tx: watch::Sender<CaptureState>,
}

impl<S, D, B> CaptureLoop<S, D, B>
where
    S: ChangeFeedSource + ?Sized,
    D: DocumentStore + ?Sized,
    B: CheckpointBackend + ?Sized,
{
    /// Build a capture loop.
    ///
    /// `marker` is both the provenance stamp written on applied documents
    /// and the value the feed filter rejects, so a relay never consumes its
    /// own writes.
    pub fn new(
        relay_id: impl Into<String>,
        source: Arc<S>,
        destination: Arc<D>,
        checkpoints: CheckpointStore<B>,
        marker: &str,
        config: CaptureConfig,
    ) -> Result<Self> {
        config.validate()?;
        let filter = FeedFilter::new(marker)?;
        let apply_retry = config.apply_retry.to_retry_config();
        let (state_tx, _) = watch::channel(CaptureState::Starting);

        Ok(Self {
            relay_id: relay_id.into(),
            source,
            writer: IdempotentWriter::new(destination, marker),
            checkpoints,
            filter,
            config,
            apply_retry,
            state_tx,
        })
    }

    /// Override the apply retry policy.
    pub fn with_apply_retry(mut self, retry: RetryConfig) -> Self {
        self.apply_retry = retry;
        self
    }

    /// Subscribe to state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    /// Run until `shutdown_rx` turns `true`, `run_for` elapses, the feed
    /// ends, or a fatal error occurs.
    ///
    /// Startup failures (checkpoint load, feed open) and fatal streaming
    /// errors are returned as `Err`. Every other exit yields the run summary.
    pub async fn run(
        self,
        shutdown_rx: watch::Receiver<bool>,
        run_for: Option<Duration>,
    ) -> Result<CaptureSummary> {
        let span = info_span!(
            "capture",
            relay = %self.relay_id,
            marker = %self.filter.own_marker(),
        );
        self.run_inner(shutdown_rx, run_for).instrument(span).await
    }

    async fn run_inner(
        self,
        mut shutdown_rx: watch::Receiver<bool>,
        run_for: Option<Duration>,
    ) -> Result<CaptureSummary> {
        let started = Instant::now();
        self.set_state(CaptureState::Starting);

        // Starting: checkpoint load and feed open, abandoned on shutdown
        let opened = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => None,
            opened = self.open() => Some(opened),
        };

        let (feed, resume_from) = match opened {
            Some(Ok(opened)) => opened,
            Some(Err(e)) => {
                match &e {
                    RelayError::ResumeUnavailable { position, .. } => error!(
                        position = %position,
                        error = %e,
                        "Checkpoint is outside the feed's retention window; operator action required"
                    ),
                    _ => error!(error = %e, "Capture failed to start"),
                }
                self.set_state(CaptureState::Closed);
                metrics::record_run_stopped(&self.relay_id, StopReason::Failed.as_str());
                return Err(e);
            }
            None => {
                info!("Shutdown requested before the feed opened");
                let mut summary = CaptureSummary::new(None);
                summary.stop_reason = StopReason::Cancelled;
                self.set_state(CaptureState::Closed);
                metrics::record_run_stopped(&self.relay_id, summary.stop_reason.as_str());
                return Ok(summary);
            }
        };

        // Streaming
        let mut summary = CaptureSummary::new(resume_from.clone());
        let (event_tx, mut event_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut pump = tokio::spawn(
            pump_feed(feed, event_tx, stop_rx, self.source.name().to_string())
                .instrument(tracing::Span::current()),
        );

        self.set_state(CaptureState::Streaming);
        info!(
            resume_from = resume_from.as_ref().map(|p| p.as_str()).unwrap_or("now"),
            source = %self.source.name(),
            run_for = ?run_for,
            "Capture streaming"
        );

        let deadline = async {
            match run_for {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let period = self.config.progress_interval_duration();
        let mut progress = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let mut failure: Option<RelayError> = None;

        loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown requested");
                    summary.stop_reason = StopReason::Cancelled;
                    break;
                }

                _ = &mut deadline => {
                    info!("Run duration elapsed");
                    summary.stop_reason = StopReason::Timer;
                    break;
                }

                _ = progress.tick() => {
                    info!(
                        received = summary.received,
                        applied = summary.applied,
                        skipped = summary.skipped,
                        failed = summary.failed,
                        checkpoint = summary.last_checkpoint.as_ref().map(|p| p.as_str()).unwrap_or("none"),
                        "Capture progress"
                    );
                }

                received = event_rx.recv() => match received {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_event(event, &mut summary).await {
                            failure = Some(e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Change feed failed");
                        failure = Some(e);
                        break;
                    }
                    None => {
                        info!("Change feed ended");
                        summary.stop_reason = StopReason::FeedEnded;
                        break;
                    }
                },
            }
        }

        // Draining: stop the pump and drop whatever it buffered
        self.set_state(CaptureState::Draining);
        let _ = stop_tx.send(true);
        drop(event_rx);

        let drain_timeout = self.config.drain_timeout_duration();
        match tokio::time::timeout(drain_timeout, &mut pump).await {
            Ok(Ok(())) => debug!("Feed pump stopped"),
            Ok(Err(e)) => warn!(error = %e, "Feed pump panicked"),
            Err(_) => {
                warn!(timeout = ?drain_timeout, "Feed pump did not stop in time, aborting");
                pump.abort();
            }
        }

        if failure.is_some() {
            summary.stop_reason = StopReason::Failed;
        }

        self.set_state(CaptureState::Closed);
        metrics::record_run_stopped(&self.relay_id, summary.stop_reason.as_str());
        info!(
            received = summary.received,
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            ignored = summary.ignored,
            last_checkpoint = summary.last_checkpoint.as_ref().map(|p| p.as_str()).unwrap_or("none"),
            held_at = summary.held_at.as_ref().map(|p| p.as_str()).unwrap_or("none"),
            stop_reason = %summary.stop_reason,
            elapsed = ?started.elapsed(),
            "Capture stopped"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn open(&self) -> Result<(Box<dyn FeedHandle>, Option<Position>)> {
        let resume_from = self.checkpoints.load().await?;
        let feed = self
            .source
            .open_change_feed(self.filter.clone(), resume_from.clone())
            .await?;
        Ok((feed, resume_from))
    }

    /// Apply one event. `Err` means the run must stop.
    async fn handle_event(&self, event: ChangeEvent, summary: &mut CaptureSummary) -> Result<()> {
        summary.received += 1;
        metrics::record_events_received(&self.relay_id, 1);

        if let Some(ts) = event.position.timestamp_ms() {
            let now = Utc::now().timestamp_millis().max(0) as u64;
            metrics::record_capture_lag_ms(&self.relay_id, now.saturating_sub(ts));
        }

        let document = match (&event.operation, &event.full_document) {
            (OperationKind::Insert, Some(document)) => document,
            _ => {
                debug!(
                    position = %event.position,
                    operation = %event.operation.as_str(),
                    "Ignoring event that is not an insert with a full document"
                );
                summary.ignored += 1;
                metrics::record_event_ignored(&self.relay_id, event.operation.as_str());
                return self.acknowledge(&event.position, summary).await;
            }
        };

        let apply_started = Instant::now();
        let result = retry("apply", &self.apply_retry, || self.writer.apply(document)).await;
        metrics::record_apply_latency(&self.relay_id, apply_started.elapsed());

        match result {
            Ok(outcome) => {
                if outcome.is_applied() {
                    summary.applied += 1;
                } else {
                    summary.skipped += 1;
                }
                self.acknowledge(&event.position, summary).await
            }
            Err(e) => {
                summary.failed += 1;
                metrics::record_event_failed(&self.relay_id);
                error!(
                    position = %event.position,
                    key = %event.document_key,
                    error = %e,
                    "Apply failed, event left unacknowledged"
                );
                if summary.held_at.is_none() {
                    warn!(position = %event.position, "Holding checkpoint for the rest of the run");
                    summary.held_at = Some(event.position);
                }
                Ok(())
            }
        }
    }

    async fn acknowledge(&self, position: &Position, summary: &mut CaptureSummary) -> Result<()> {
        if let Some(held) = &summary.held_at {
            debug!(position = %position, held_at = %held, "Checkpoint held, not advancing");
            metrics::record_checkpoint_held(&self.relay_id);
            return Ok(());
        }

        match self.checkpoints.save(position).await {
            Ok(()) => {
                metrics::record_checkpoint_save(&self.relay_id, true);
                summary.last_checkpoint = Some(position.clone());
                Ok(())
            }
            Err(e) => {
                metrics::record_checkpoint_save(&self.relay_id, false);
                error!(position = %position, error = %e, "Checkpoint save failed");
                Err(e)
            }
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state_tx.send_replace(state);
        metrics::set_capture_state(&self.relay_id, &state.to_string());
        debug!(state = %state, "Capture state");
    }
}

/// Resolve once the flag turns `true`. A dropped sender never resolves.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Move events from the feed into the channel until stopped.
///
/// Non-fatal feed errors (one bad entry) are logged and skipped. A fatal
/// error is forwarded so the apply loop can stop the run.
async fn pump_feed(
    mut feed: Box<dyn FeedHandle>,
    tx: mpsc::Sender<Result<ChangeEvent>>,
    mut stop_rx: watch::Receiver<bool>,
    source: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut stop_rx) => break,
            next = feed.next_event() => next,
        };

        match next {
            Ok(Some(event)) => {
                let sent = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut stop_rx) => false,
                    sent = tx.send(Ok(event)) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Ok(None) => {
                debug!(source = %source, "Feed exhausted");
                break;
            }
            Err(e) if !e.is_fatal_for_feed() => {
                warn!(source = %source, error = %e, "Skipping unreadable feed entry");
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }

    if let Err(e) = feed.close().await {
        warn!(source = %source, error = %e, "Failed to close change feed");
    }
}
