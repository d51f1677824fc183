//! # Change-Feed Relay
//!
//! Replicates newly inserted documents from a source data store to a
//! destination data store by tailing the source's change feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              changefeed-relay                            │
//! │                                                                          │
//! │  ┌──────────────┐    ┌─────────────┐    ┌─────────────────────────────┐  │
//! │  │ Change feed  │───►│ CaptureLoop │───►│ IdempotentWriter            │  │
//! │  │ (FeedFilter  │    │ (one event  │    │ (stamp sync_source/sync_dt, │  │
//! │  │  pushed down)│    │  at a time) │    │  insert if absent)          │  │
//! │  └──────────────┘    └─────────────┘    └─────────────────────────────┘  │
//! │                             │                                            │
//! │                             ▼                                            │
//! │                    ┌─────────────────┐                                   │
//! │                    │ CheckpointStore │  (after every successful apply)   │
//! │                    └─────────────────┘                                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **At-least-once**: a position is checkpointed only after its document
//!    is in the destination, so a crash redelivers rather than loses.
//! 2. **Idempotent apply**: redelivered documents are skipped by key.
//! 3. **Loop prevention**: each direction stamps its own marker and its feed
//!    rejects documents carrying that marker. With two relays in opposite
//!    directions, a replicated document's echo reaches the peer relay once
//!    and ends there as an idempotent skip.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changefeed_relay::{Relay, RelayConfig, RunMode};
//!
//! #[tokio::main]
//! async fn main() -> changefeed_relay::Result<()> {
//!     let config = RelayConfig::from_json_file("relay.json")?;
//!     let relay = Relay::from_config(&config).await?;
//!
//!     let summary = relay.run(RunMode::from_config(&config.settings.run)?).await?;
//!     println!("{} applied, {} skipped", summary.applied, summary.skipped);
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod document;
pub mod error;
pub mod feed;
pub mod filter;
pub mod metrics;
pub mod relay;
pub mod resilience;
pub mod store;
pub mod writer;

// Re-exports for convenience
pub use capture::{CaptureLoop, CaptureState, CaptureSummary, StopReason};
pub use checkpoint::{CheckpointStore, SqliteCheckpointBackend};
pub use config::{CaptureConfig, CheckpointConfig, RedisStoreConfig, RelayConfig, RelaySettings};
pub use document::{Document, DocumentKey};
pub use error::{RelayError, Result};
pub use feed::{ChangeEvent, OperationKind, Position};
pub use filter::FeedFilter;
pub use relay::{Relay, RunMode, ShutdownHandle};
pub use resilience::RetryConfig;
pub use store::{MemoryStore, RedisStore};
pub use writer::{ApplyOutcome, IdempotentWriter, SkipReason};
