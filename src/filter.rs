// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Loop-prevention filter.
//!
//! In a bidirectional deployment each relay stamps the documents it writes
//! with its own marker. Without filtering, relay A's writes to B would show
//! up on B's feed and be copied straight back by relay B, forever.
//!
//! The filter is part of the subscription request: stores evaluate it before
//! handing events to the consumer, so excluded events never reach the writer.

use crate::error::{RelayError, Result};
use crate::feed::ChangeEvent;
use serde_json::{json, Value};

/// Subscription predicate: inserts not already carrying our marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    own_marker: String,
}

impl FeedFilter {
    /// Create a filter for the given provenance marker.
    pub fn new(own_marker: impl Into<String>) -> Result<Self> {
        let own_marker = own_marker.into();
        if own_marker.trim().is_empty() {
            return Err(RelayError::Config(
                "sync_source marker must not be empty".to_string(),
            ));
        }
        Ok(Self { own_marker })
    }

    pub fn own_marker(&self) -> &str {
        &self.own_marker
    }

    /// `true` if the event should be delivered.
    ///
    /// Only inserts pass. An insert whose document has no `sync_source`, or
    /// a peer's marker, is accepted; one carrying our own marker is not.
    pub fn accept(&self, event: &ChangeEvent) -> bool {
        event.is_insert() && event.sync_source() != Some(self.own_marker.as_str())
    }

    /// Render the predicate as a declarative match document, for stores
    /// that accept pipeline-style subscriptions.
    pub fn to_match_expression(&self) -> Value {
        json!({
            "operationType": "insert",
            "fullDocument.sync_source": { "$ne": self.own_marker },
        })
    }
}
