//! Session server
//!
//! The per-user daemon that owns sessions: PTY masters, shell children, and
//! the grid snapshots of detached sessions. Front-ends talk to it over the
//! runtime-directory socket; masters cross to them by descriptor passing.

pub mod daemon;
pub mod dispatch;
pub mod session;

pub use daemon::{connect, connect_or_spawn};
pub use dispatch::{Server, ServerError};
pub use session::{Session, MAX_PANES};
