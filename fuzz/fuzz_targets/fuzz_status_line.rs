//! Fuzz target: `decode_line`
//!
//! Arbitrary text must decode or fail cleanly. A decoded status frame must
//! survive a re-encode and decode with identical contents.
//!
//! cargo fuzz run fuzz_status_line

#![no_main]

use aqua_core::protocol::{DeviceLine, decode_line, encode_status};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(DeviceLine::Status(frame)) = decode_line(data) {
        if frame.version_matches() {
            let again = decode_line(&encode_status(&frame));
            assert!(matches!(again, Ok(DeviceLine::Status(f)) if f == frame));
        }
    }
});
