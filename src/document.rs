// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Documents and provenance stamping.
//!
//! A document is a JSON object whose identity lives in its `_id` field.
//! Documents written by the relay additionally carry two provenance fields:
//!
//! - `sync_source`: marker naming the relay direction that wrote it
//! - `sync_dt`: RFC 3339 UTC timestamp of the synchronization
//!
//! The loop-prevention filter inspects `sync_source` to avoid re-syncing
//! the relay's own writes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field holding a document's identity.
pub const ID_FIELD: &str = "_id";
/// Provenance marker field.
pub const SYNC_SOURCE_FIELD: &str = "sync_source";
/// Synchronization timestamp field.
pub const SYNC_DT_FIELD: &str = "sync_dt";

/// Identity of a document, wrapping its `_id` value.
///
/// The canonical string form is the lookup key in every store: a JSON
/// string is used verbatim, anything else is its compact JSON encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(Value);

impl DocumentKey {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The raw `_id` value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Canonical string form used as the storage key.
    pub fn canonical(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A full document payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a document from a JSON value. Returns `None` unless it's an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Build a document from its JSON encoding.
    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Encode as compact JSON.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The document key, if `_id` is present.
    pub fn key(&self) -> Option<DocumentKey> {
        self.0.get(ID_FIELD).cloned().map(DocumentKey)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field, returning self for chaining.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// The provenance marker, if this document was written by a relay.
    pub fn sync_source(&self) -> Option<&str> {
        self.0.get(SYNC_SOURCE_FIELD).and_then(Value::as_str)
    }

    /// The synchronization timestamp, if present and well-formed.
    pub fn sync_dt(&self) -> Option<DateTime<Utc>> {
        self.0
            .get(SYNC_DT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Return a copy stamped with provenance metadata.
    ///
    /// Existing `sync_source`/`sync_dt` values are overwritten; `_id` and
    /// every other field are preserved.
    pub fn stamped(&self, marker: &str, at: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.0.insert(
            SYNC_SOURCE_FIELD.to_string(),
            Value::String(marker.to_string()),
        );
        copy.0.insert(
            SYNC_DT_FIELD.to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        copy
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}
