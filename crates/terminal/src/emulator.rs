//! Emulator adaptor
//!
//! Wraps the embedded VT emulator (`alacritty_terminal`) behind the small
//! surface the rest of the crate needs: feed PTY output, mirror the live
//! screen into a [`Grid`], capture rows that scrolled off the top into the
//! grid's ring, surface the bytes the terminal wants written back to the
//! PTY, and replay a saved grid into a fresh emulator on attach.
//!
//! The emulator's own scrollback is used only as a staging area: after every
//! feed the newly scrolled rows are drained into the grid's ring and the
//! emulator history is cleared, so it never saturates and the grid stays the
//! single owner of history.

use std::sync::mpsc;

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::cell::Flags;
use alacritty_terminal::term::{Config as TermConfig, Term};
use alacritty_terminal::vte::ansi::{self, Color, NamedColor};

use crate::cell::{
    rgb_to_cube, Cell, ATTR_BOLD, ATTR_ITALIC, ATTR_REVERSE, ATTR_UNDERLINE, COLOR_BG_DEFAULT,
    COLOR_FG_DEFAULT,
};
use crate::grid::Grid;

/// Forwards emulator events onto a channel the adaptor drains.
struct EventProxy {
    sender: mpsc::Sender<Event>,
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

/// Size handle for constructing and resizing the emulator.
struct GridSize {
    cols: usize,
    rows: usize,
}

impl Dimensions for GridSize {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// The embedded terminal for one pane.
pub struct Emulator {
    term: Term<EventProxy>,
    parser: ansi::Processor,
    events: mpsc::Receiver<Event>,
    /// Soft-wrap state of the row directly above live row 0.
    pending_wrap: bool,
}

impl Emulator {
    /// Create an emulator of the given size. `scrollback` bounds how many
    /// rows one feed may scroll before capture (the grid's ring is the
    /// real history).
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        let (sender, events) = mpsc::channel();
        let proxy = EventProxy { sender };

        let config = TermConfig {
            scrolling_history: scrollback,
            ..TermConfig::default()
        };
        let size = GridSize { cols: cols as usize, rows: rows as usize };
        let term = Term::new(config, &size, proxy);

        Self {
            term,
            parser: ansi::Processor::new(),
            events,
            pending_wrap: false,
        }
    }

    /// Feed raw PTY output through the escape-sequence parser.
    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.parser.advance(&mut self.term, *byte);
        }
    }

    /// Bytes the terminal wants written back to the PTY (cursor position
    /// reports and similar).
    pub fn take_responses(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.events.try_iter() {
            if let Event::PtyWrite(text) = event {
                out.extend_from_slice(text.as_bytes());
            }
        }
        out
    }

    /// Resize the emulator screen.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.term.resize(GridSize { cols: cols as usize, rows: rows as usize });
    }

    /// True while the application has the alternate screen active.
    pub fn is_alternate_screen(&self) -> bool {
        use alacritty_terminal::term::TermMode;
        self.term.mode().contains(TermMode::ALT_SCREEN)
    }

    /// Mirror the emulator into `grid`: drain newly scrolled rows into the
    /// ring, then copy every live cell and the wrap flags. Returns the
    /// cursor position.
    pub fn sync_to_grid(&mut self, grid: &mut Grid) -> (u16, u16) {
        self.capture_scrollback(grid);

        let cols = self.term.grid().columns().min(grid.width());
        let rows = self.term.grid().screen_lines().min(grid.height());

        for y in 0..rows {
            let cont = if y == 0 { self.pending_wrap } else { self.row_wrapped(Line(y as i32 - 1)) };
            grid.set_row_cont(y, cont);

            let row = &self.term.grid()[Line(y as i32)];
            for x in 0..cols {
                let cell = &row[Column(x)];
                grid.set_cell(x, y, convert_cell(cell.c, cell.fg, cell.bg, cell.flags));
            }
        }

        let cursor = self.term.grid().cursor.point;
        let cx = (cursor.column.0 as u16).min(grid.width().saturating_sub(1) as u16);
        let cy = (cursor.line.0.max(0) as u16).min(grid.height().saturating_sub(1) as u16);
        (cx, cy)
    }

    /// Repaint a saved grid into the emulator with an ANSI program and park
    /// the cursor. Scrollback is not replayed; the grid's ring already holds
    /// it.
    pub fn replay_grid(&mut self, grid: &Grid, cursor: (u16, u16)) {
        let mut program = String::from("\x1b[2J\x1b[H");
        let mut last_style: Option<(u8, u8, u8, u8)> = None;

        for y in 0..grid.height() {
            program.push_str(&format!("\x1b[{};1H", y + 1));
            let mut x = 0;
            while x < grid.width() {
                let cell = grid.cell(x, y);
                let style = (cell.attrs, cell.fg, cell.bg, cell.color_flags);
                if last_style != Some(style) {
                    program.push_str("\x1b[0m");
                    if cell.attrs & ATTR_BOLD != 0 {
                        program.push_str("\x1b[1m");
                    }
                    if cell.attrs & ATTR_ITALIC != 0 {
                        program.push_str("\x1b[3m");
                    }
                    if cell.attrs & ATTR_UNDERLINE != 0 {
                        program.push_str("\x1b[4m");
                    }
                    if cell.attrs & ATTR_REVERSE != 0 {
                        program.push_str("\x1b[7m");
                    }
                    if cell.color_flags & COLOR_FG_DEFAULT == 0 {
                        program.push_str(&format!("\x1b[38;5;{}m", cell.fg));
                    }
                    if cell.color_flags & COLOR_BG_DEFAULT == 0 {
                        program.push_str(&format!("\x1b[48;5;{}m", cell.bg));
                    }
                    last_style = Some(style);
                }
                program.push(cell.ch);
                x += cell.width.max(1) as usize;
            }
        }

        program.push_str("\x1b[0m");
        program.push_str(&format!("\x1b[{};{}H", cursor.1 + 1, cursor.0 + 1));

        self.feed(program.as_bytes());

        // The repaint itself must not look like scrolled output.
        self.term.grid_mut().clear_history();
        self.pending_wrap = false;
    }

    /// Move rows the emulator scrolled off the top into the grid's ring,
    /// oldest first, then clear the emulator's staging history.
    fn capture_scrollback(&mut self, grid: &mut Grid) {
        let hist = self.term.grid().history_size();
        if hist == 0 {
            return;
        }

        for i in 0..hist {
            let line = Line(i as i32 - hist as i32);
            let cont = self.pending_wrap;
            let cells = self.read_row(line, grid.width());
            self.pending_wrap = self.row_wrapped(line);
            grid.push_history(cells, cont);
        }

        self.term.grid_mut().clear_history();
    }

    fn read_row(&self, line: Line, width: usize) -> Box<[Cell]> {
        let row = &self.term.grid()[line];
        let cols = self.term.grid().columns().min(width.max(1));
        let mut cells = Vec::with_capacity(cols);
        for x in 0..cols {
            let cell = &row[Column(x)];
            cells.push(convert_cell(cell.c, cell.fg, cell.bg, cell.flags));
        }
        cells.into_boxed_slice()
    }

    fn row_wrapped(&self, line: Line) -> bool {
        let grid = self.term.grid();
        let hist = grid.history_size() as i32;
        if line.0 < -hist {
            return false;
        }
        let cols = grid.columns();
        if cols == 0 {
            return false;
        }
        grid[line][Column(cols - 1)].flags.contains(Flags::WRAPLINE)
    }
}

/// Translate one emulator cell into the grid's plain representation.
fn convert_cell(c: char, fg: Color, bg: Color, flags: Flags) -> Cell {
    if flags.contains(Flags::WIDE_CHAR_SPACER) {
        return Cell::blank();
    }

    let mut attrs = 0u8;
    if flags.contains(Flags::BOLD) {
        attrs |= ATTR_BOLD;
    }
    if flags.contains(Flags::ITALIC) {
        attrs |= ATTR_ITALIC;
    }
    if flags.contains(Flags::UNDERLINE) {
        attrs |= ATTR_UNDERLINE;
    }
    if flags.contains(Flags::INVERSE) {
        attrs |= ATTR_REVERSE;
    }

    let mut color_flags = 0u8;
    let fg = match resolve_color(fg) {
        Some(index) => index,
        None => {
            color_flags |= COLOR_FG_DEFAULT;
            7
        }
    };
    let bg = match resolve_color(bg) {
        Some(index) => index,
        None => {
            color_flags |= COLOR_BG_DEFAULT;
            0
        }
    };

    Cell {
        ch: if c == '\0' { ' ' } else { c },
        width: if flags.contains(Flags::WIDE_CHAR) { 2 } else { 1 },
        fg,
        bg,
        attrs,
        color_flags,
    }
}

/// Map an emulator color to a palette index; `None` means the terminal
/// default. RGB colors are projected onto the 216-color cube.
fn resolve_color(color: Color) -> Option<u8> {
    match color {
        Color::Indexed(index) => Some(index),
        Color::Spec(rgb) => Some(rgb_to_cube(rgb.r, rgb.g, rgb.b)),
        Color::Named(named) => match named {
            NamedColor::Black | NamedColor::DimBlack => Some(0),
            NamedColor::Red | NamedColor::DimRed => Some(1),
            NamedColor::Green | NamedColor::DimGreen => Some(2),
            NamedColor::Yellow | NamedColor::DimYellow => Some(3),
            NamedColor::Blue | NamedColor::DimBlue => Some(4),
            NamedColor::Magenta | NamedColor::DimMagenta => Some(5),
            NamedColor::Cyan | NamedColor::DimCyan => Some(6),
            NamedColor::White | NamedColor::DimWhite => Some(7),
            NamedColor::BrightBlack => Some(8),
            NamedColor::BrightRed => Some(9),
            NamedColor::BrightGreen => Some(10),
            NamedColor::BrightYellow => Some(11),
            NamedColor::BrightBlue => Some(12),
            NamedColor::BrightMagenta => Some(13),
            NamedColor::BrightCyan => Some(14),
            NamedColor::BrightWhite => Some(15),
            _ => None,
        },
    }
}
