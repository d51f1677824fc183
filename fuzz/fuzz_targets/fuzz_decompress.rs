//! Fuzz target for change-entry payload decompression.
//!
//! This tests that `maybe_decompress` never panics on arbitrary input.

#![no_main]

use changefeed_relay::store::redis::maybe_decompress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);
});
