#![no_main]
//! Fuzz target for wire-frame and snapshot parsing
//!
//! Feeds random bytes to the frame reader and the grid snapshot decoder to
//! find panics, hangs, or oversized allocations in deserialization.

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Framed message parsing must never panic, whatever the peer sends.
    let mut cursor = std::io::Cursor::new(data);
    let _ = protocol::read_message(&mut cursor);

    // Neither must snapshot decoding; a bad length or geometry is an error,
    // not an allocation request.
    let _ = terminal::snapshot::deserialize(data);
});
