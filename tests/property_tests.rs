//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use changefeed_relay::config::RunConfig;
use changefeed_relay::document::{SYNC_DT_FIELD, SYNC_SOURCE_FIELD};
use changefeed_relay::feed::{compare_positions, parse_position_timestamp, position_lag_ms};
use changefeed_relay::store::redis::maybe_decompress;
use changefeed_relay::{
    ApplyOutcome, ChangeEvent, Document, DocumentKey, FeedFilter, IdempotentWriter, MemoryStore,
    OperationKind, Position, SkipReason,
};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Position Ordering Properties
// =============================================================================

proptest! {
    /// Position comparison is reflexive: a == a
    #[test]
    fn position_comparison_reflexive(ms in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let p = format!("{}-{}", ms, seq);
        prop_assert_eq!(compare_positions(&p, &p), Ordering::Equal);
    }

    /// Position comparison is antisymmetric: if a < b then b > a
    #[test]
    fn position_comparison_antisymmetric(
        ms1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ms2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let a = format!("{}-{}", ms1, seq1);
        let b = format!("{}-{}", ms2, seq2);
        prop_assert_eq!(compare_positions(&a, &b).reverse(), compare_positions(&b, &a));
    }

    /// Position comparison is transitive
    #[test]
    fn position_comparison_transitive(
        ms1 in 0u64..1_000_000u64,
        seq1 in 0u64..100u64,
        ms2 in 0u64..1_000_000u64,
        seq2 in 0u64..100u64,
        ms3 in 0u64..1_000_000u64,
        seq3 in 0u64..100u64,
    ) {
        let a = Position::from_parts(ms1, seq1);
        let b = Position::from_parts(ms2, seq2);
        let c = Position::from_parts(ms3, seq3);

        if a < b && b < c {
            prop_assert!(a < c);
        }
        if a > b && b > c {
            prop_assert!(a > c);
        }
    }

    /// Ordering matches the numeric (millis, sequence) tuple, not the string
    #[test]
    fn position_order_is_numeric(
        ms1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..10_000u64,
        ms2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..10_000u64,
    ) {
        let a = Position::from_parts(ms1, seq1);
        let b = Position::from_parts(ms2, seq2);
        prop_assert_eq!(a.cmp(&b), (ms1, seq1).cmp(&(ms2, seq2)));
    }

    /// The millisecond component round-trips through parsing
    #[test]
    fn position_timestamp_parsing(ms in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let p = Position::from_parts(ms, seq);
        prop_assert_eq!(p.timestamp_ms(), Some(ms));
        prop_assert_eq!(parse_position_timestamp(p.as_str()), Some(ms));
    }

    /// Lag is never negative and is exact when the checkpoint trails
    #[test]
    fn position_lag_saturates(
        ms1 in 0u64..1_000_000_000_000u64,
        ms2 in 0u64..1_000_000_000_000u64,
        seq in 0u64..100u64,
    ) {
        let checkpoint = format!("{}-{}", ms1, seq);
        let latest = format!("{}-0", ms2);
        prop_assert_eq!(position_lag_ms(&checkpoint, &latest), Some(ms2.saturating_sub(ms1)));
    }

    /// Arbitrary tokens never panic the comparator
    #[test]
    fn position_comparison_total_on_garbage(a in ".{0,40}", b in ".{0,40}") {
        let ab = compare_positions(&a, &b);
        let ba = compare_positions(&b, &a);
        prop_assert_eq!(ab.reverse(), ba);
    }
}

// =============================================================================
// Feed Filter Properties
// =============================================================================

fn op_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Insert),
        Just(OperationKind::Update),
        Just(OperationKind::Replace),
        Just(OperationKind::Delete),
        "[a-z]{1,12}".prop_map(|s| OperationKind::parse(&s)),
    ]
}

proptest! {
    /// Accepted iff it's an insert whose marker differs from ours
    #[test]
    fn filter_accepts_exactly_foreign_inserts(
        own in "[a-z][a-z-]{0,20}",
        carried in prop::option::of("[a-z][a-z-]{0,20}"),
        op in op_strategy(),
    ) {
        let filter = FeedFilter::new(own.clone()).unwrap();

        let mut doc = Document::from_value(json!({"_id": "k"})).unwrap();
        if let Some(m) = &carried {
            doc.insert(SYNC_SOURCE_FIELD, m.clone());
        }
        let event = ChangeEvent {
            operation: op.clone(),
            document_key: DocumentKey::from("k"),
            full_document: Some(doc),
            position: Position::from_parts(1, 0),
        };

        let expected = op == OperationKind::Insert && carried.as_deref() != Some(own.as_str());
        prop_assert_eq!(filter.accept(&event), expected);
    }

    /// A document stamped with a marker is always rejected by that marker's filter
    #[test]
    fn filter_rejects_own_stamp(
        own in "[a-z][a-z-]{0,20}",
        prior in prop::option::of("[a-z][a-z-]{0,20}"),
        secs in 0i64..4_000_000_000i64,
    ) {
        let filter = FeedFilter::new(own.clone()).unwrap();
        let mut doc = Document::from_value(json!({"_id": 7, "payload": "x"})).unwrap();
        if let Some(p) = prior {
            doc.insert(SYNC_SOURCE_FIELD, p);
        }
        let at = Utc.timestamp_opt(secs, 0).unwrap();

        let event = ChangeEvent::insert(doc.stamped(&own, at), Position::from_parts(1, 0)).unwrap();
        prop_assert!(!filter.accept(&event));
    }

    /// Blank markers are refused
    #[test]
    fn filter_rejects_blank_marker(blank in "[ \t]{0,8}") {
        prop_assert!(FeedFilter::new(blank).is_err());
    }
}

// =============================================================================
// Provenance Stamping Properties
// =============================================================================

proptest! {
    /// Stamping adds the two provenance fields and leaves the rest untouched
    #[test]
    fn stamping_preserves_other_fields(
        fields in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..10),
        marker in "[a-z][a-z-]{0,20}",
    ) {
        let mut doc = Document::from_value(json!({"_id": "k"})).unwrap();
        for (k, v) in &fields {
            if k != SYNC_SOURCE_FIELD && k != SYNC_DT_FIELD {
                doc.insert(k.clone(), *v);
            }
        }

        let stamped = doc.stamped(&marker, Utc::now());

        prop_assert_eq!(stamped.sync_source(), Some(marker.as_str()));
        prop_assert!(stamped.sync_dt().is_some());
        for (k, v) in doc.as_map() {
            prop_assert_eq!(stamped.get(k), Some(v));
        }
        prop_assert_eq!(stamped.len(), doc.len() + 2);
    }
}

// =============================================================================
// Idempotent Writer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any delivery sequence applies each key once; the first version wins
    #[test]
    fn writer_first_write_wins(
        deliveries in prop::collection::vec((0u8..8, any::<i32>()), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dest = Arc::new(MemoryStore::new("dest"));
            let writer = IdempotentWriter::new(Arc::clone(&dest), "prop-marker");

            let mut first_seen = std::collections::HashMap::new();
            let mut applied = 0usize;

            for (key, value) in &deliveries {
                let id = format!("k{}", key);
                let doc = Document::from_value(json!({"_id": id, "value": value})).unwrap();
                let outcome = writer.apply(&doc).await.unwrap();

                if first_seen.contains_key(&id) {
                    prop_assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::AlreadyPresent));
                } else {
                    prop_assert_eq!(outcome, ApplyOutcome::Applied);
                    first_seen.insert(id, *value);
                    applied += 1;
                }
            }

            prop_assert_eq!(dest.document_count().await, applied);
            for (id, value) in &first_seen {
                let stored = dest.document(id).await.unwrap();
                prop_assert_eq!(stored.get("value"), Some(&json!(value)));
                prop_assert_eq!(stored.sync_source(), Some("prop-marker"));
            }
            Ok(())
        })?;
    }
}

// =============================================================================
// Config Duration Properties
// =============================================================================

proptest! {
    /// Whole-second run durations parse exactly
    #[test]
    fn run_duration_seconds(secs in 1u64..1_000_000u64) {
        let run = RunConfig { duration: Some(format!("{}s", secs)) };
        prop_assert_eq!(run.duration().unwrap(), Some(Duration::from_secs(secs)));
    }

    /// Mixed-unit durations sum their parts
    #[test]
    fn run_duration_mixed_units(mins in 1u64..1000u64, ms in 1u64..1000u64) {
        let run = RunConfig { duration: Some(format!("{}m {}ms", mins, ms)) };
        prop_assert_eq!(
            run.duration().unwrap(),
            Some(Duration::from_secs(mins * 60) + Duration::from_millis(ms))
        );
    }

    /// Unitless numbers are rejected rather than guessed
    #[test]
    fn run_duration_requires_unit(n in 1u64..1_000_000u64) {
        let run = RunConfig { duration: Some(n.to_string()) };
        prop_assert!(run.duration().is_err());
    }
}

// =============================================================================
// Decompression Properties
// =============================================================================

proptest! {
    /// Non-zstd data passes through unchanged
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        let is_zstd = data.len() >= 4 && data[..4] == [0x28, 0xB5, 0x2F, 0xFD];
        if !is_zstd {
            prop_assert_eq!(maybe_decompress(&data).unwrap(), data);
        }
    }

    /// zstd-compressed payloads decode to the original bytes
    #[test]
    fn decompress_zstd_roundtrip(data in prop::collection::vec(any::<u8>(), 1..10000)) {
        let compressed = zstd::encode_all(data.as_slice(), 3).unwrap();
        prop_assert_eq!(maybe_decompress(&compressed).unwrap(), data);
    }
}
