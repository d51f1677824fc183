//! Configuration for the relay.
//!
//! Configuration can be constructed programmatically or deserialized from
//! JSON (see [`RelayConfig::from_json_file`]). Durations are humantime
//! strings (`"5s"`, `"10m"`, `"500ms"`).
//!
//! # Quick Start
//!
//! ```rust
//! use changefeed_relay::config::{RelayConfig, RedisStoreConfig};
//!
//! let config = RelayConfig {
//!     relay_id: "legacy-to-atlas".into(),
//!     sync_source: "legacy-changestream".into(),
//!     source: RedisStoreConfig::for_testing("legacy", "redis://legacy:6379"),
//!     destination: RedisStoreConfig::for_testing("atlas", "redis://atlas:6379"),
//!     settings: Default::default(),
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── relay_id: String              # Name used in logs and metrics
//! ├── sync_source: String           # Provenance marker for this direction
//! ├── settings: RelaySettings
//! │   ├── capture: CaptureConfig    # Channel size, apply retry, progress logs
//! │   ├── checkpoint: CheckpointConfig
//! │   └── run: RunConfig            # Bounded or unbounded run
//! ├── source: RedisStoreConfig      # Where changes are read from
//! └── destination: RedisStoreConfig # Where documents are written
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "relay_id": "legacy-to-atlas",
//!   "sync_source": "legacy-changestream",
//!   "settings": {
//!     "capture": { "channel_capacity": 64, "progress_interval": "30s" },
//!     "checkpoint": { "backend": "destination" },
//!     "run": { "duration": "10m" }
//!   },
//!   "source": { "name": "legacy", "url": "redis://legacy:6379" },
//!   "destination": { "name": "atlas", "url": "redis://atlas:6379" }
//! }
//! ```

use crate::error::{RelayError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Identity of this relay (one direction of a deployment).
    pub relay_id: String,

    /// Provenance marker stamped on every document this relay writes.
    /// Must differ between the two directions of a bidirectional setup.
    pub sync_source: String,

    /// Tunable parameters.
    #[serde(default)]
    pub settings: RelaySettings,

    /// Store the change feed is read from.
    pub source: RedisStoreConfig,

    /// Store documents are written to.
    pub destination: RedisStoreConfig,
}

impl RelayConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(relay_id: &str, sync_source: &str) -> Self {
        Self {
            relay_id: relay_id.to_string(),
            sync_source: sync_source.to_string(),
            settings: RelaySettings::for_testing(),
            source: RedisStoreConfig::for_testing("source", "redis://127.0.0.1:6379"),
            destination: RedisStoreConfig::for_testing("destination", "redis://127.0.0.1:6380"),
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| RelayError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values that would only fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.relay_id.trim().is_empty() {
            return Err(RelayError::Config("relay_id must not be empty".into()));
        }
        if self.sync_source.trim().is_empty() {
            return Err(RelayError::Config("sync_source marker must not be empty".into()));
        }
        self.settings.validate()?;
        self.source.validate("source")?;
        self.destination.validate("destination")?;
        Ok(())
    }
}

/// Parse a humantime duration, naming the field on failure.
fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| RelayError::Config(format!("Invalid duration for {}: {:?} ({})", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelaySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelaySettings {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub run: RunConfig,
}

impl RelaySettings {
    /// Fast settings for tests: short intervals, quick retries.
    pub fn for_testing() -> Self {
        Self {
            capture: CaptureConfig::for_testing(),
            checkpoint: CheckpointConfig {
                save_retry: RetrySettings::for_testing(),
                ..Default::default()
            },
            run: RunConfig::default(),
        }
    }

    /// Check every nested section.
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.checkpoint.validate()?;
        self.run.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: serde form of RetryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy as it appears in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "200ms".to_string()
}

fn default_max_delay() -> String {
    "5s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: "200ms".to_string(),
            max_delay: "5s".to_string(),
            backoff_factor: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RelayError::Config(format!("{}.max_attempts must be at least 1", field)));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(RelayError::Config(format!("{}.backoff_factor must be >= 1.0", field)));
        }
        parse_duration(&format!("{}.initial_delay", field), &self.initial_delay)?;
        parse_duration(&format!("{}.max_delay", field), &self.max_delay)?;
        Ok(())
    }

    /// Convert to a [`RetryConfig`], falling back to defaults for bad durations.
    pub fn to_retry_config(&self) -> RetryConfig {
        let base = RetryConfig::per_event();
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: humantime::parse_duration(&self.initial_delay).unwrap_or(base.initial_delay),
            max_delay: humantime::parse_duration(&self.max_delay).unwrap_or(base.max_delay),
            backoff_factor: self.backoff_factor,
            connection_timeout: base.connection_timeout,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CaptureConfig: capture loop settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Capture loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Events buffered between the feed pump and the apply loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Retry policy for retryable apply failures.
    #[serde(default)]
    pub apply_retry: RetrySettings,

    /// How often to log progress (e.g. "30s").
    #[serde(default = "default_progress_interval")]
    pub progress_interval: String,

    /// How long to wait for the feed pump to stop while draining.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_channel_capacity() -> usize {
    64
}

fn default_progress_interval() -> String {
    "30s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            apply_retry: RetrySettings::default(),
            progress_interval: "30s".to_string(),
            drain_timeout: "10s".to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 8,
            apply_retry: RetrySettings::for_testing(),
            progress_interval: "1s".to_string(),
            drain_timeout: "2s".to_string(),
        }
    }

    /// Parse the progress_interval string to a Duration.
    pub fn progress_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.progress_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the drain_timeout string to a Duration.
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(RelayError::Config("capture.channel_capacity must be at least 1".into()));
        }
        let interval = parse_duration("capture.progress_interval", &self.progress_interval)?;
        if interval.is_zero() {
            return Err(RelayError::Config("capture.progress_interval must be non-zero".into()));
        }
        parse_duration("capture.drain_timeout", &self.drain_timeout)?;
        self.apply_retry.validate("capture.apply_retry")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: where the checkpoint record lives
// ═══════════════════════════════════════════════════════════════════════════════

/// Which backend holds the checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackendKind {
    /// The destination store (checkpoint hash next to the documents).
    #[default]
    Destination,
    /// A local SQLite file.
    Sqlite,
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Record id of the checkpoint.
    #[serde(default = "default_checkpoint_id")]
    pub id: String,

    #[serde(default)]
    pub backend: CheckpointBackendKind,

    /// Path to SQLite database (only used with the `sqlite` backend).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Retry policy for checkpoint saves.
    #[serde(default)]
    pub save_retry: RetrySettings,
}

fn default_checkpoint_id() -> String {
    crate::checkpoint::DEFAULT_CHECKPOINT_ID.to_string()
}

fn default_sqlite_path() -> String {
    "relay_checkpoints.db".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            id: default_checkpoint_id(),
            backend: CheckpointBackendKind::Destination,
            sqlite_path: default_sqlite_path(),
            save_retry: RetrySettings::default(),
        }
    }
}

impl CheckpointConfig {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RelayError::Config("checkpoint.id must not be empty".into()));
        }
        if self.backend == CheckpointBackendKind::Sqlite && self.sqlite_path.trim().is_empty() {
            return Err(RelayError::Config("checkpoint.sqlite_path must not be empty".into()));
        }
        self.save_retry.validate("checkpoint.save_retry")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RunConfig: bounded vs unbounded runs
// ═══════════════════════════════════════════════════════════════════════════════

/// Run length configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    /// Stop after this long ("30s", "10m"). Absent = run until cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl RunConfig {
    /// Parsed run duration, if bounded.
    pub fn duration(&self) -> Result<Option<Duration>> {
        self.duration
            .as_deref()
            .map(|d| parse_duration("run.duration", d))
            .transpose()
    }

    fn validate(&self) -> Result<()> {
        self.duration().map(|_| ())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedisStoreConfig: one entry per store
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a Redis-backed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Store name (for logging and metrics).
    pub name: String,

    /// Redis URL, e.g. `"redis://legacy.example.com:6379"`.
    pub url: String,

    /// Stream carrying change events.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Prefix for document keys.
    #[serde(default = "default_document_prefix")]
    pub document_prefix: String,

    /// Hash holding checkpoint records.
    #[serde(default = "default_checkpoint_key")]
    pub checkpoint_key: String,

    /// XREAD block timeout as a duration string (e.g., "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries to read per XREAD call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Whether inserts also append an `insert` entry to the stream, so a
    /// peer relay can consume them.
    #[serde(default = "default_true")]
    pub emit_changes: bool,

    /// Timeout for each connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_stream_key() -> String {
    "changes".to_string()
}

fn default_document_prefix() -> String {
    "doc:".to_string()
}

fn default_checkpoint_key() -> String {
    "relay:checkpoints".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl RedisStoreConfig {
    /// Create a store config for testing.
    pub fn for_testing(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            stream_key: default_stream_key(),
            document_prefix: default_document_prefix(),
            checkpoint_key: default_checkpoint_key(),
            block_timeout: "100ms".to_string(),
            batch_size: 100,
            emit_changes: true,
            connect_timeout: "2s".to_string(),
        }
    }

    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Parse the connect_timeout string to a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Redis key holding the document with canonical key `key`.
    pub fn document_key(&self, key: &str) -> String {
        format!("{}{}", self.document_prefix, key)
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(RelayError::Config(format!("{}.url must not be empty", role)));
        }
        if self.stream_key.is_empty() {
            return Err(RelayError::Config(format!("{}.stream_key must not be empty", role)));
        }
        if self.batch_size == 0 {
            return Err(RelayError::Config(format!("{}.batch_size must be at least 1", role)));
        }
        parse_duration(&format!("{}.block_timeout", role), &self.block_timeout)?;
        parse_duration(&format!("{}.connect_timeout", role), &self.connect_timeout)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
