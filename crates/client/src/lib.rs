//! Front-end: event loop, state machine, rendering
//!
//! Everything the foreground `muxkit` process does: raw-mode terminal
//! handling, the readiness loop over stdin + server link + pane masters,
//! prefix-key dispatch, pane layout, and ANSI rendering. Sessions
//! themselves live in the server; this crate only ever holds its own copies
//! of the PTY masters.

pub mod app;
pub mod fsm;
pub mod keybinds;
pub mod render;
pub mod term;
pub mod window;

pub use app::{
    create_detached_session, handshake, kill_session, list_sessions, nesting_detected, App,
    ClientError,
};
pub use keybinds::{Keybinds, PrefixAction, PREFIX_KEY};
