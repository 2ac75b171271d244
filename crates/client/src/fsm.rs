//! Front-end finite state machine
//!
//! Literal table dispatch: a fixed array of `(state, event, next, action)`
//! tuples scanned linearly per event. Unknown pairs are logged by the caller
//! and ignored. `Exiting` absorbs everything.

/// Front-end lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Boot,
    Running,
    /// Present for completeness; resizing is handled synchronously from
    /// `Running` and nothing transitions here.
    #[allow(dead_code)]
    Resizing,
    Exiting,
}

/// Events fed to the state machine by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    EnableRawMode,
    Winch,
    ChldExit,
    PtyRead,
    StdinRead,
    EofPty,
    EofStdin,
    Interrupt,
    Detached,
    PaneSplit,
    /// Reserved; nothing emits it.
    #[allow(dead_code)]
    SyncInput,
}

/// Side effects the application runs on a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    EnterRawMode,
    Resize,
    RestoreTerminal,
    FeedPane,
    HandleKeys,
    SnapshotAndDetach,
    Split,
}

/// One row of the transition table.
pub struct Transition {
    pub from: State,
    pub on: FsmEvent,
    pub to: State,
    pub action: Option<Action>,
}

pub static TRANSITIONS: &[Transition] = &[
    Transition { from: State::Boot, on: FsmEvent::EnableRawMode, to: State::Running, action: Some(Action::EnterRawMode) },
    Transition { from: State::Running, on: FsmEvent::Winch, to: State::Running, action: Some(Action::Resize) },
    Transition { from: State::Running, on: FsmEvent::ChldExit, to: State::Exiting, action: Some(Action::RestoreTerminal) },
    Transition { from: State::Running, on: FsmEvent::PtyRead, to: State::Running, action: Some(Action::FeedPane) },
    Transition { from: State::Running, on: FsmEvent::StdinRead, to: State::Running, action: Some(Action::HandleKeys) },
    Transition { from: State::Running, on: FsmEvent::EofPty, to: State::Exiting, action: Some(Action::RestoreTerminal) },
    Transition { from: State::Running, on: FsmEvent::EofStdin, to: State::Exiting, action: None },
    Transition { from: State::Running, on: FsmEvent::Interrupt, to: State::Exiting, action: None },
    Transition { from: State::Running, on: FsmEvent::Detached, to: State::Exiting, action: Some(Action::SnapshotAndDetach) },
    Transition { from: State::Running, on: FsmEvent::PaneSplit, to: State::Running, action: Some(Action::Split) },
];

/// Resolve a `(state, event)` pair. `Exiting` swallows every event.
pub fn lookup(state: State, event: FsmEvent) -> Option<(State, Option<Action>)> {
    if state == State::Exiting {
        return Some((State::Exiting, None));
    }
    TRANSITIONS
        .iter()
        .find(|t| t.from == state && t.on == event)
        .map(|t| (t.to, t.action))
}
