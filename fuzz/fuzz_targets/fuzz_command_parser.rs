//! Fuzz target: `CommandParser::feed`
//!
//! Line noise ahead of a valid command must not stop the parser from
//! recognising it once the stream resynchronises on `<`.
//!
//! cargo fuzz run fuzz_command_parser

#![no_main]

use aqua_core::protocol::{Command, CommandParser};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = CommandParser::new();
    let _ = parser.feed(data);

    let cmd = Command::RequiredCo2Valve(true);
    let got = parser.feed(cmd.encode().as_bytes());
    assert_eq!(got.last(), Some(&cmd));
});
