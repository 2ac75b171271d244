//! Test harness for muxkit
//!
//! Infrastructure for exercising the session server and the pane model
//! without a real terminal:
//!
//! - `fixtures::TestServer` runs the dispatcher on a private socket in a
//!   background thread, with reaping forced every iteration.
//! - `fixtures::LoopbackPane` is a pane whose PTY slave the test holds, so
//!   "shell output" is just a write into the slave.
//!
//! Tests that need a working `/dev/pts` or fork are skipped when `CI` is
//! set, matching the convention used across the crates' unit tests.

pub mod fixtures;

pub use fixtures::{ci, LoopbackPane, TestServer};
