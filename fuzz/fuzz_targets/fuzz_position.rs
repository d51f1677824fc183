//! Fuzz target for position comparison.
//!
//! Checks that comparing arbitrary position tokens never panics and that
//! the ordering stays antisymmetric and reflexive.

#![no_main]

use changefeed_relay::feed::{compare_positions, parse_position_timestamp};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_positions(a, b);
    let ba = compare_positions(b, a);
    assert_eq!(ab.reverse(), ba);

    assert_eq!(compare_positions(a, a), Ordering::Equal);

    // A parsed timestamp must agree with the ordering's millisecond component
    if let (Some(a_ms), Some(b_ms)) = (parse_position_timestamp(a), parse_position_timestamp(b)) {
        if a_ms < b_ms {
            assert_ne!(ab, Ordering::Greater);
        }
    }
});
