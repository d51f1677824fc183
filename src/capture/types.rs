//! Capture loop state types.
//!
//! # State Transitions
//!
//! ```text
//!            checkpoint loaded,
//!              feed opened
//! Starting ─────────────────────→ Streaming
//!    │                                │
//!    │ (load/open failed)             │ stop signal, feed ended,
//!    │                                │ or fatal error
//!    │                                ↓
//!    │                            Draining
//!    │                                │ in-flight apply done,
//!    │                                │ feed closed
//!    ↓                                ↓
//!  Closed ←───────────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Starting**: Loading the checkpoint and opening the feed subscription.
//! - **Streaming**: Applying events one at a time and checkpointing each.
//! - **Draining**: No new events accepted; the in-flight apply finishes.
//! - **Closed**: Subscription released. Terminal.

use crate::feed::Position;

/// State of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Loading checkpoint and opening the feed.
    Starting,

    /// Receiving and applying events.
    Streaming,

    /// Stop requested; finishing the in-flight event.
    Draining,

    /// Feed closed. Terminal.
    Closed,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureState::Starting => write!(f, "Starting"),
            CaptureState::Streaming => write!(f, "Streaming"),
            CaptureState::Draining => write!(f, "Draining"),
            CaptureState::Closed => write!(f, "Closed"),
        }
    }
}

/// Why a capture run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The bounded run duration elapsed.
    Timer,
    /// Shutdown was requested.
    Cancelled,
    /// The feed reported it has no more events.
    FeedEnded,
    /// A fatal error stopped the run.
    Failed,
}

impl StopReason {
    /// Metric label for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Timer => "timer",
            StopReason::Cancelled => "cancelled",
            StopReason::FeedEnded => "feed_ended",
            StopReason::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters and final positions of a capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Events handed to the apply loop
    pub received: u64,
    /// Documents inserted at the destination
    pub applied: u64,
    /// Documents already present (redelivery or concurrent insert)
    pub skipped: u64,
    /// Events whose apply failed (left unacknowledged)
    pub failed: u64,
    /// Non-insert events acknowledged without applying
    pub ignored: u64,
    /// Last position durably checkpointed during this run (or the resume
    /// position if nothing new was checkpointed)
    pub last_checkpoint: Option<Position>,
    /// First failed position, if the checkpoint was held
    pub held_at: Option<Position>,
    pub stop_reason: StopReason,
}

impl CaptureSummary {
    pub(crate) fn new(resume_from: Option<Position>) -> Self {
        Self {
            received: 0,
            applied: 0,
            skipped: 0,
            failed: 0,
            ignored: 0,
            last_checkpoint: resume_from,
            held_at: None,
            stop_reason: StopReason::FeedEnded,
        }
    }

    /// `true` if a failure pinned the checkpoint during this run.
    pub fn is_held(&self) -> bool {
        self.held_at.is_some()
    }
}
