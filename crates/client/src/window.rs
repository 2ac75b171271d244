//! Window layout
//!
//! One window: a left-to-right strip of equal-width panes separated by
//! single-column borders, above a one-row status bar. Pane `i` sits at
//! `xoff = i · (width + 1)`; the rightmost pane is clipped to whatever
//! columns remain, and leftover columns are simply not rendered.

use terminal::Pane;

/// Computed geometry for one pane: `(sx, sy, xoff, yoff)`.
pub type PaneGeometry = (u16, u16, u16, u16);

/// Equal-width strip layout for `count` panes on a `rows × cols` terminal.
/// The last row is reserved for the status bar.
pub fn layout(rows: u16, cols: u16, count: usize) -> Vec<PaneGeometry> {
    let count = count.max(1) as u16;
    let width = (cols / count).max(1);
    let sy = rows.saturating_sub(1).max(1);

    (0..count)
        .map(|i| {
            let xoff = i * (width + 1);
            let sx = width.min(cols.saturating_sub(xoff)).max(1);
            (sx, sy, xoff, 0)
        })
        .collect()
}

/// The front-end's pane collection.
pub struct Window {
    pub panes: Vec<Pane>,
    pub active: usize,
    pub name: String,
    next_pane_id: u32,
}

impl Window {
    pub fn new(name: impl Into<String>) -> Self {
        Self { panes: Vec::new(), active: 0, name: name.into(), next_pane_id: 0 }
    }

    /// Next pane id, unique within this window.
    pub fn take_pane_id(&mut self) -> u32 {
        let id = self.next_pane_id;
        self.next_pane_id += 1;
        id
    }

    pub fn active_pane(&mut self) -> Option<&mut Pane> {
        self.panes.get_mut(self.active)
    }

    /// Cycle the active pane left to right, wrapping.
    pub fn next_pane(&mut self) {
        if !self.panes.is_empty() {
            self.active = (self.active + 1) % self.panes.len();
        }
    }

    /// Drop a pane (its master closes with it). If it was active, the next
    /// pane in list order takes over; when the removed pane was last, the
    /// previous pane (the new last) does.
    pub fn remove_pane(&mut self, idx: usize) {
        if idx >= self.panes.len() {
            return;
        }
        self.panes.remove(idx);
        if self.panes.is_empty() {
            self.active = 0;
            return;
        }
        if idx < self.active {
            self.active -= 1;
        } else if idx == self.active && self.active >= self.panes.len() {
            self.active = self.panes.len() - 1;
        }
    }

    /// Re-apply the strip layout after a terminal resize or pane
    /// add/remove. Each pane's grid, emulator, and PTY size follow.
    pub fn apply_layout(&mut self, rows: u16, cols: u16) {
        let geometry = layout(rows, cols, self.panes.len());
        for (pane, (sx, sy, xoff, yoff)) in self.panes.iter_mut().zip(geometry) {
            if let Err(e) = pane.resize(sx, sy, xoff, yoff) {
                tracing::warn!(pane = pane.id, error = %e, "pane resize failed");
            }
        }
    }
}
