//! Pane model: terminal emulator + cell grid + scrollback + serialization
//!
//! This crate is the in-memory terminal model that makes detach and attach
//! transparent: a plain-data cell grid with a scrollback ring, a snapshot
//! codec for shipping grids across the session socket, an adaptor around the
//! embedded VT emulator, the pane that ties those together, and the
//! server-side PTY/shell spawn.

pub mod cell;
pub mod emulator;
pub mod grid;
pub mod pane;
pub mod pty;
pub mod snapshot;

pub use cell::Cell;
pub use grid::Grid;
pub use pane::{Pane, PANE_HISTORY};
pub use pty::{spawn_shell, PtyError, ShellChild};
