//! ANSI rendering
//!
//! Stateless re-emission: every redraw hides the cursor, repaints the panes
//! from their grids, draws the borders and the status bar, and repositions
//! the cursor at the active pane. Attribute resets separate
//! attribute-differing runs; 256-color SGR is emitted only for cells that do
//! not carry a default-color flag.

use std::fmt::Write as _;

use terminal::cell::{
    Cell, ATTR_BOLD, ATTR_ITALIC, ATTR_REVERSE, ATTR_UNDERLINE, COLOR_BG_DEFAULT, COLOR_FG_DEFAULT,
};
use terminal::Pane;

use crate::window::Window;

/// Marker shown in the status bar while the active pane views history.
const HISTORY_MARKER: &str = "[history]";

/// Version string shown right-aligned in the status bar.
const VERSION_TAG: &str = concat!("muxkit ", env!("CARGO_PKG_VERSION"));

/// Append the SGR run for one cell, assuming a just-reset state.
fn push_style(out: &mut String, cell: &Cell) {
    out.push_str("\x1b[0m");
    if cell.attrs & ATTR_BOLD != 0 {
        out.push_str("\x1b[1m");
    }
    if cell.attrs & ATTR_ITALIC != 0 {
        out.push_str("\x1b[3m");
    }
    if cell.attrs & ATTR_UNDERLINE != 0 {
        out.push_str("\x1b[4m");
    }
    if cell.attrs & ATTR_REVERSE != 0 {
        out.push_str("\x1b[7m");
    }
    if cell.color_flags & COLOR_FG_DEFAULT == 0 {
        let _ = write!(out, "\x1b[38;5;{}m", cell.fg);
    }
    if cell.color_flags & COLOR_BG_DEFAULT == 0 {
        let _ = write!(out, "\x1b[48;5;{}m", cell.bg);
    }
}

/// Paint one pane from its grid into `out`.
fn render_pane(out: &mut String, pane: &Pane) {
    let width = pane.sx as usize;
    let blank = Cell::blank();

    for y in 0..pane.sy {
        let _ = write!(out, "\x1b[{};{}H", pane.yoff + y + 1, pane.xoff + 1);
        let row = pane.grid.display_line(y as usize);

        let mut style: Option<(u8, u8, u8, u8)> = None;
        let mut x = 0;
        while x < width {
            // Rows from the ring may be narrower than the live width.
            let cell = row.get(x).unwrap_or(&blank);
            let signature = (cell.attrs, cell.fg, cell.bg, cell.color_flags);
            if style != Some(signature) {
                push_style(out, cell);
                style = Some(signature);
            }
            out.push(cell.ch);
            // A wide cell covers the following column; skip its spacer.
            x += cell.width.max(1) as usize;
        }
    }
    out.push_str("\x1b[0m");
}

/// Vertical borders between adjacent panes: a blue `│` column.
fn render_borders(out: &mut String, window: &Window) {
    for pair in window.panes.windows(2) {
        let column = pair[1].xoff;
        if column == 0 {
            continue;
        }
        out.push_str("\x1b[0m\x1b[34m");
        for y in 0..pair[0].sy {
            let _ = write!(out, "\x1b[{};{}H│", y + 1, column);
        }
        out.push_str("\x1b[0m");
    }
}

/// Status bar: window name on the left, version right-aligned, white on
/// blue, with the history marker while scrolled back.
fn render_status(out: &mut String, window: &Window, rows: u16, cols: u16, in_history: bool) {
    let cols = cols as usize;
    let mut left = format!(" {}", window.name);
    if in_history {
        left.push(' ');
        left.push_str(HISTORY_MARKER);
    }

    let mut bar = left;
    if bar.len() > cols {
        bar.truncate(cols);
    }
    let right = VERSION_TAG;
    if bar.len() + right.len() + 1 <= cols {
        let pad = cols - bar.len() - right.len();
        bar.push_str(&" ".repeat(pad));
        bar.push_str(right);
    } else {
        bar.push_str(&" ".repeat(cols - bar.len()));
    }

    let _ = write!(out, "\x1b[{};1H\x1b[0m\x1b[37;44m{bar}\x1b[0m", rows);
}

/// Compose a full redraw of the window into one escape-sequence program.
///
/// `sync_input` is wired through to a cursor-shape escape but has no way to
/// become true.
pub fn render_window(window: &Window, rows: u16, cols: u16, sync_input: bool) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("\x1b[?25l");

    for pane in &window.panes {
        render_pane(&mut out, pane);
    }
    render_borders(&mut out, window);

    let in_history = window
        .panes
        .get(window.active)
        .map(|p| p.in_history())
        .unwrap_or(false);
    render_status(&mut out, window, rows, cols, in_history);

    if sync_input {
        out.push_str("\x1b[5 q");
    }

    if let Some(active) = window.panes.get(window.active) {
        if !in_history {
            let _ = write!(
                &mut out,
                "\x1b[{};{}H\x1b[?25h",
                active.yoff + active.cy + 1,
                active.xoff + active.cx + 1,
            );
        }
    }

    out
}
