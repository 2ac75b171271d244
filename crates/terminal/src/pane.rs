//! Pane: one PTY rendered through an embedded terminal
//!
//! A pane owns its grid, its emulator instance, and the front-end's copy of
//! the PTY master received from the server by descriptor passing. Geometry
//! is assigned by the window layout; the grid always matches `sx × sy`
//! outside a resize transaction.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use rustix::termios::{tcsetwinsize, Winsize};
use thiserror::Error;

use crate::emulator::Emulator;
use crate::grid::Grid;
use crate::snapshot::{self, SnapshotError};

/// Scrollback capacity of every pane, in rows.
pub const PANE_HISTORY: usize = 1000;

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to set PTY window size: {0}")]
    Winsize(rustix::io::Errno),

    #[error("snapshot rejected: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// One terminal pane.
pub struct Pane {
    /// Pane id, unique within the window.
    pub id: u32,
    /// Width in columns.
    pub sx: u16,
    /// Height in rows.
    pub sy: u16,
    /// Column offset of the pane's left edge on screen.
    pub xoff: u16,
    /// Row offset of the pane's top edge on screen.
    pub yoff: u16,
    /// Cursor column, pane-relative.
    pub cx: u16,
    /// Cursor row, pane-relative.
    pub cy: u16,
    /// Canonical screen model.
    pub grid: Grid,
    emulator: Emulator,
    master: File,
}

impl Pane {
    /// Build a pane around a PTY master received from the server.
    pub fn new(id: u32, sx: u16, sy: u16, xoff: u16, yoff: u16, master: OwnedFd) -> Self {
        Self {
            id,
            sx,
            sy,
            xoff,
            yoff,
            cx: 0,
            cy: 0,
            grid: Grid::new(sx as usize, sy as usize, PANE_HISTORY),
            emulator: Emulator::new(sx, sy, PANE_HISTORY),
            master: File::from(master),
        }
    }

    /// Raw master descriptor for the readiness wait.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Borrowed master descriptor for the readiness wait.
    pub fn master_as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Read whatever the shell produced. The caller polls first, so a short
    /// read is the norm; 0 means the child side hung up.
    pub fn read_master(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.master.read(buf)
    }

    /// Feed shell output into the emulator and mirror the result into the
    /// grid. Bytes the terminal answers with (cursor reports and such) are
    /// written back to the master.
    pub fn handle_output(&mut self, bytes: &[u8]) -> Result<(), PaneError> {
        self.emulator.feed(bytes);

        let responses = self.emulator.take_responses();
        if !responses.is_empty() {
            self.master.write_all(&responses)?;
        }

        let (cx, cy) = self.emulator.sync_to_grid(&mut self.grid);
        self.cx = cx;
        self.cy = cy;
        Ok(())
    }

    /// Forward keyboard bytes to the shell.
    pub fn write_input(&mut self, bytes: &[u8]) -> Result<(), PaneError> {
        self.master.write_all(bytes)?;
        Ok(())
    }

    /// Resize transaction for this pane: reflow history on width change,
    /// reshape the grid, resize the emulator, clamp the cursor, and tell the
    /// PTY about its new size.
    pub fn resize(&mut self, sx: u16, sy: u16, xoff: u16, yoff: u16) -> Result<(), PaneError> {
        if sx as usize != self.grid.width() {
            self.grid.reflow(sx as usize);
        }
        self.grid.resize(sx as usize, sy as usize);
        self.emulator.resize(sx, sy);

        self.sx = sx;
        self.sy = sy;
        self.xoff = xoff;
        self.yoff = yoff;
        self.cx = self.cx.min(sx.saturating_sub(1));
        self.cy = self.cy.min(sy.saturating_sub(1));

        let winsize = Winsize { ws_row: sy, ws_col: sx, ws_xpixel: 0, ws_ypixel: 0 };
        tcsetwinsize(self.master.as_fd(), winsize).map_err(PaneError::Winsize)?;
        Ok(())
    }

    /// Serialize the grid for the detach cache.
    pub fn snapshot(&self) -> Vec<u8> {
        snapshot::serialize(&self.grid, self.id, (self.cx, self.cy))
    }

    /// Replace the grid with a cached snapshot and repaint the emulator to
    /// match. The snapshot's pane id was matched by the caller.
    ///
    /// The snapshot carries the geometry of the detaching terminal; it is
    /// reflowed and reshaped here so the grid keeps matching `sx × sy`.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), PaneError> {
        let (_, cursor, mut grid) = snapshot::deserialize(bytes)?;
        if grid.width() != self.sx as usize {
            grid.reflow(self.sx as usize);
        }
        if grid.width() != self.sx as usize || grid.height() != self.sy as usize {
            grid.resize(self.sx as usize, self.sy as usize);
        }
        self.grid = grid;
        self.cx = cursor.0.min(self.sx.saturating_sub(1));
        self.cy = cursor.1.min(self.sy.saturating_sub(1));
        self.emulator.replay_grid(&self.grid, (self.cx, self.cy));
        Ok(())
    }

    /// Scroll into history, stopping at the oldest stored row.
    pub fn scroll_up(&mut self, n: usize) {
        self.grid.scroll_up(n);
    }

    /// Scroll back toward the live screen.
    pub fn scroll_down(&mut self, n: usize) {
        self.grid.scroll_down(n);
    }

    /// True while the pane views history instead of the live screen.
    pub fn in_history(&self) -> bool {
        self.grid.scroll_offset() > 0
    }

    /// Leave history mode.
    pub fn exit_history(&mut self) {
        let offset = self.grid.scroll_offset();
        self.grid.scroll_down(offset);
    }
}
