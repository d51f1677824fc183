//! Fuzz target for lag calculation.
//!
//! `position_lag_ms` and `parse_position_timestamp` must never panic on
//! arbitrary input.

#![no_main]

use changefeed_relay::feed::{parse_position_timestamp, position_lag_ms};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (checkpoint, latest) = data;

    let _ = parse_position_timestamp(checkpoint);
    let _ = parse_position_timestamp(latest);
    let _ = position_lag_ms(checkpoint, latest);
});
