//! Server-side sessions
//!
//! A session is the unit of persistence: up to `MAX_PANES` shell children
//! with their PTY masters, a detached flag, and the snapshot cache that
//! bridges one front-end's detach to the next one's attach. Sessions die
//! only when every pane's shell has exited (or on an explicit kill).

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::process::Child;

use protocol::WindowSize;

/// Hard cap on panes per session.
pub const MAX_PANES: usize = 64;

/// One occupied pane slot: the server's master copy and the shell child.
pub struct PaneSlot {
    pub master: OwnedFd,
    pub child: Child,
}

/// One persistent session.
pub struct Session {
    /// Monotone id; never reused after the session is freed.
    pub id: u32,
    /// Connection currently bound to this session, if any.
    pub attached_conn: Option<u64>,
    /// True between a detach request and the next successful attach.
    pub detached: bool,
    /// Pane slots in creation order; freed slots stay as `None`.
    slots: Vec<Option<PaneSlot>>,
    /// Grid snapshots saved at detach, keyed by pane id, consumed on attach.
    pub grid_cache: HashMap<u32, Vec<u8>>,
    /// Most recent client-reported window size. Cached for protocol
    /// compatibility; never propagated to PTYs (the front-end is
    /// authoritative for per-pane sizes).
    pub last_resize: Option<WindowSize>,
    /// Total panes ever spawned; distinguishes a brand-new session from one
    /// whose shells all exited.
    panes_spawned: u32,
}

impl Session {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            attached_conn: None,
            detached: false,
            slots: Vec::new(),
            grid_cache: HashMap::new(),
            last_resize: None,
            panes_spawned: 0,
        }
    }

    /// Number of live panes.
    pub fn pane_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// True when at least one pane was spawned and none is left.
    pub fn is_dead(&self) -> bool {
        self.panes_spawned > 0 && self.pane_count() == 0
    }

    /// Store a new pane slot. The caller has already checked `MAX_PANES`.
    pub fn add_pane(&mut self, slot: PaneSlot) {
        debug_assert!(self.pane_count() < MAX_PANES);
        self.panes_spawned += 1;
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(free) => *free = Some(slot),
            None => self.slots.push(Some(slot)),
        }
    }

    /// Live masters in slot order (the attach transfer order).
    pub fn live_masters(&self) -> impl Iterator<Item = &OwnedFd> {
        self.slots.iter().flatten().map(|slot| &slot.master)
    }

    /// Pid of the first live pane's shell, for the session listing.
    pub fn first_pid(&self) -> Option<u32> {
        self.slots.iter().flatten().next().map(|slot| slot.child.id())
    }

    /// Reap exited children: free their slots and close the masters.
    /// Returns the number of slots freed.
    pub fn reap(&mut self) -> usize {
        let mut freed = 0;
        for slot in &mut self.slots {
            let exited = match slot {
                Some(pane) => matches!(pane.child.try_wait(), Ok(Some(_)) | Err(_)),
                None => false,
            };
            if exited {
                // Dropping the slot closes the master.
                *slot = None;
                freed += 1;
            }
        }
        freed
    }

    /// Force-kill every pane shell and wait for it; drops all masters.
    pub fn kill_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(pane) = slot {
                let _ = pane.child.kill();
                let _ = pane.child.wait();
            }
            *slot = None;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .field("panes", &self.pane_count())
            .field("cached_grids", &self.grid_cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sleeper() -> PaneSlot {
        let pair = terminal::pty::open_pty(80, 24).unwrap();
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        PaneSlot { master: pair.master, child }
    }

    #[test]
    fn fresh_session_is_not_dead() {
        let session = Session::new(0);
        assert_eq!(session.pane_count(), 0);
        assert!(!session.is_dead());
    }

    #[test]
    fn pane_count_tracks_slots() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let mut session = Session::new(1);
        session.add_pane(spawn_sleeper());
        session.add_pane(spawn_sleeper());
        assert_eq!(session.pane_count(), 2);
        assert_eq!(session.live_masters().count(), 2);
        assert!(session.first_pid().is_some());

        session.kill_all();
        assert_eq!(session.pane_count(), 0);
        assert!(session.is_dead());
    }

    #[test]
    fn reap_frees_exited_children() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let mut session = Session::new(2);
        let pair = terminal::pty::open_pty(80, 24).unwrap();
        let child = std::process::Command::new("true").spawn().unwrap();
        session.add_pane(PaneSlot { master: pair.master, child });

        // `true` exits immediately; give it a moment.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(session.reap(), 1);
        assert!(session.is_dead());
    }
}
