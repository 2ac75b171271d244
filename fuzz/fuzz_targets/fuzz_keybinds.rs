#![no_main]
//! Fuzz target for keybinding-file parsing
//!
//! Feeds random bytes as a keybinds.conf body; unknown tokens and broken
//! lines must be skipped, never panic.

use libfuzzer_sys::fuzz_target;

use client::Keybinds;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let mut binds = Keybinds::default();
        binds.merge(s);
    }
});
