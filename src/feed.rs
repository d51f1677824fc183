// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events and feed positions.
//!
//! A change feed yields [`ChangeEvent`]s in a total order. Each event carries
//! a [`Position`], an opaque token the feed can resume from.
//!
//! # Position Format
//!
//! Positions are opaque to the capture loop, but both shipped stores mint
//! them as `{millis}-{sequence}` (the Redis Stream entry ID shape, e.g.
//! `"1234567890123-0"`). [`compare_positions`] orders them numerically, not
//! lexicographically, and [`position_lag_ms`] derives capture lag from the
//! millisecond component.

use crate::document::{Document, DocumentKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque, totally ordered token for an event's place in the feed.
///
/// Equality, hashing and ordering all go through the numeric
/// `(millis, sequence)` value, so `"01-0"` and `"1-0"` are the same position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Build a position from its millisecond and sequence components.
    pub fn from_parts(millis: u64, sequence: u64) -> Self {
        Self(format!("{}-{}", millis, sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond component, if the token has the `{millis}-{seq}` shape.
    pub fn timestamp_ms(&self) -> Option<u64> {
        parse_position_timestamp(&self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Position {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Position {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Position {}

impl Hash for Position {
    fn hash<H: Hasher>(&self, state: &mut H) {
        position_parts(&self.0).hash(state);
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_positions(&self.0, &other.0)
    }
}

/// Change operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
    /// Anything else the feed reports (drop, invalidate, ...).
    Other(String),
}

impl OperationKind {
    /// Parse an operation name (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "insert" => OperationKind::Insert,
            "update" => OperationKind::Update,
            "replace" => OperationKind::Replace,
            "delete" | "del" => OperationKind::Delete,
            _ => OperationKind::Other(s.to_string()),
        }
    }

    /// Wire name for this operation.
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Replace => "replace",
            OperationKind::Delete => "delete",
            OperationKind::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event from a change feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Operation type (only inserts are acted upon)
    pub operation: OperationKind,
    /// Key of the affected document
    pub document_key: DocumentKey,
    /// Complete document at capture time (absent for deletes)
    pub full_document: Option<Document>,
    /// This event's place in the feed
    pub position: Position,
}

impl ChangeEvent {
    /// Build an insert event for a document. Returns `None` if it has no `_id`.
    pub fn insert(document: Document, position: Position) -> Option<Self> {
        let document_key = document.key()?;
        Some(Self {
            operation: OperationKind::Insert,
            document_key,
            full_document: Some(document),
            position,
        })
    }

    pub fn is_insert(&self) -> bool {
        self.operation == OperationKind::Insert
    }

    /// Provenance marker carried by the full document, if any.
    pub fn sync_source(&self) -> Option<&str> {
        self.full_document.as_ref().and_then(|d| d.sync_source())
    }
}

/// Compare two positions.
///
/// Positions are formatted as `{millis}-{sequence}` and compared numerically.
/// Unknown shapes compare as `0`, so they sort first.
pub fn compare_positions(a: &str, b: &str) -> Ordering {
    position_parts(a).cmp(&position_parts(b))
}

fn position_parts(s: &str) -> (u64, u64) {
    match s.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (s.parse().unwrap_or(0), 0),
    }
}

/// Parse the millisecond timestamp from a position.
///
/// Returns `None` for malformed tokens or special cases like `"0"`.
pub fn parse_position_timestamp(position: &str) -> Option<u64> {
    let (ms, seq) = position.split_once('-')?;
    if seq.contains('-') {
        return None;
    }
    ms.parse().ok()
}

/// Lag in milliseconds between a checkpoint and the newest known position.
///
/// Returns `None` if either can't be parsed, and 0 if the checkpoint is ahead.
pub fn position_lag_ms(checkpoint: &str, latest: &str) -> Option<u64> {
    let checkpoint_ms = parse_position_timestamp(checkpoint)?;
    let latest_ms = parse_position_timestamp(latest)?;
    Some(latest_ms.saturating_sub(checkpoint_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_parse() {
        assert_eq!(OperationKind::parse("insert"), OperationKind::Insert);
        assert_eq!(OperationKind::parse("INSERT"), OperationKind::Insert);
        assert_eq!(OperationKind::parse("update"), OperationKind::Update);
        assert_eq!(OperationKind::parse("Replace"), OperationKind::Replace);
        assert_eq!(OperationKind::parse("delete"), OperationKind::Delete);
        assert_eq!(OperationKind::parse("DEL"), OperationKind::Delete);
        assert_eq!(
            OperationKind::parse("invalidate"),
            OperationKind::Other("invalidate".to_string())
        );
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Insert.to_string(), "insert");
        assert_eq!(OperationKind::Other("drop".into()).to_string(), "drop");
    }

    #[test]
    fn test_compare_positions() {
        use std::cmp::Ordering;

        assert_eq!(compare_positions("1000-0", "1000-0"), Ordering::Equal);
        assert_eq!(compare_positions("1000-0", "2000-0"), Ordering::Less);
        assert_eq!(compare_positions("1000-5", "1000-2"), Ordering::Greater);
        // Numeric, not lexicographic
        assert_eq!(compare_positions("999-0", "1000-0"), Ordering::Less);
        assert_eq!(compare_positions("1000-9", "1000-10"), Ordering::Less);
        // Special cases
        assert_eq!(compare_positions("0", "1-0"), Ordering::Less);
        assert_eq!(compare_positions("garbage", "0-0"), Ordering::Equal);
    }

    #[test]
    fn test_position_ord() {
        let mut positions = vec![
            Position::from("1000-10"),
            Position::from("999-0"),
            Position::from("1000-9"),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                Position::from("999-0"),
                Position::from("1000-9"),
                Position::from("1000-10"),
            ]
        );
    }

    #[test]
    fn test_position_eq_agrees_with_ord() {
        use std::collections::HashSet;

        let a = Position::from("1-0");
        let b = Position::from("01-0");
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);

        let set: HashSet<Position> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        assert_ne!(Position::from("1-0"), Position::from("1-1"));
    }

    #[test]
    fn test_position_from_parts() {
        let pos = Position::from_parts(1234567890123, 4);
        assert_eq!(pos.as_str(), "1234567890123-4");
        assert_eq!(pos.timestamp_ms(), Some(1234567890123));
    }

    #[test]
    fn test_parse_position_timestamp() {
        assert_eq!(parse_position_timestamp("1234567890123-0"), Some(1234567890123));
        assert_eq!(parse_position_timestamp("0"), None);
        assert_eq!(parse_position_timestamp("abc-0"), None);
        assert_eq!(parse_position_timestamp("1-2-3"), None);
        assert_eq!(parse_position_timestamp(""), None);
    }

    #[test]
    fn test_position_lag_ms() {
        assert_eq!(position_lag_ms("1000-0", "1500-3"), Some(500));
        assert_eq!(position_lag_ms("1500-0", "1500-9"), Some(0));
        // Checkpoint ahead of latest saturates
        assert_eq!(position_lag_ms("2000-0", "1000-0"), Some(0));
        assert_eq!(position_lag_ms("0", "1000-0"), None);
    }

    #[test]
    fn test_change_event_insert() {
        let doc = Document::new().with("_id", "a1").with("value", 5);
        let event = ChangeEvent::insert(doc, Position::from("1-0")).unwrap();
        assert!(event.is_insert());
        assert_eq!(event.document_key.canonical(), "a1");
        assert!(event.sync_source().is_none());

        assert!(ChangeEvent::insert(Document::new(), Position::from("1-0")).is_none());
    }
}
