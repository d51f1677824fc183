// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent writer.
//!
//! Applies captured documents to the destination so that any number of
//! redeliveries collapse to a single write (first write wins):
//!
//! ```text
//! stamp(doc) ─► find_by_key ─┬─ absent  ─► insert ─┬─ ok        ─► Applied
//!                            │                     └─ duplicate ─► Skipped(ConcurrentInsert)
//!                            └─ present ─► Skipped(AlreadyPresent)
//! ```
//!
//! The writer never retries. Connectivity and constraint errors propagate to
//! the capture loop, which owns the retry policy.

use crate::document::{Document, DocumentKey};
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::store::DocumentStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a write was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The key was already present when checked.
    AlreadyPresent,
    /// Another writer inserted the key between our check and our insert.
    ConcurrentInsert,
}

/// Result of applying one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ApplyOutcome::Skipped(_))
    }

    /// Metric label for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Skipped(SkipReason::AlreadyPresent) => "skipped_already_present",
            ApplyOutcome::Skipped(SkipReason::ConcurrentInsert) => "skipped_concurrent_insert",
        }
    }
}

/// Writes documents to the destination, tagged with provenance.
pub struct IdempotentWriter<D: DocumentStore + ?Sized> {
    destination: Arc<D>,
    marker: String,
}

impl<D: DocumentStore + ?Sized> IdempotentWriter<D> {
    pub fn new(destination: Arc<D>, marker: impl Into<String>) -> Self {
        Self {
            destination,
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn destination(&self) -> &Arc<D> {
        &self.destination
    }

    /// Apply a document: stamp it, then insert unless its key already exists.
    pub async fn apply(&self, document: &Document) -> Result<ApplyOutcome> {
        let key = document
            .key()
            .ok_or_else(|| RelayError::apply("<none>", "document has no _id"))?;

        let stamped = document.stamped(&self.marker, Utc::now());

        let result = self.write(&key, stamped).await;
        match &result {
            Ok(outcome) => {
                debug!(key = %key, outcome = outcome.as_str(), marker = %self.marker, "Document write");
                metrics::record_write(&self.marker, outcome.as_str());
            }
            Err(e) => {
                warn!(key = %key, error = %e, marker = %self.marker, "Document write failed");
                metrics::record_write(&self.marker, "failed");
            }
        }
        result
    }

    async fn write(&self, key: &DocumentKey, stamped: Document) -> Result<ApplyOutcome> {
        if self.destination.find_by_key(key).await?.is_some() {
            return Ok(ApplyOutcome::Skipped(SkipReason::AlreadyPresent));
        }

        match self.destination.insert(stamped).await {
            Ok(()) => Ok(ApplyOutcome::Applied),
            Err(e) if e.is_benign() => Ok(ApplyOutcome::Skipped(SkipReason::ConcurrentInsert)),
            Err(e) => Err(e),
        }
    }
}
