//! Controlling-terminal handling
//!
//! Raw mode (no canonical input, no echo, no signal generation, no CR→NL
//! translation) plus the alternate screen buffer. The original settings are
//! captured once; every exit path restores them, with the guard's `Drop` as
//! the backstop.

use std::io::Write;

use rustix::termios::{
    tcgetattr, tcgetwinsize, tcsetattr, InputModes, LocalModes, OptionalActions, Termios,
};

/// Enter the alternate screen buffer.
pub const ALT_SCREEN_ENTER: &str = "\x1b[?1049h";
/// Return to the main screen buffer.
pub const ALT_SCREEN_LEAVE: &str = "\x1b[?1049l";

/// Raw-mode guard over the controlling terminal.
pub struct RawTerminal {
    original: Termios,
    restored: bool,
}

impl RawTerminal {
    /// Capture the current settings, switch to raw mode, and enter the
    /// alternate screen.
    pub fn enter() -> std::io::Result<Self> {
        let stdin = rustix::stdio::stdin();
        let original = tcgetattr(stdin)
            .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;

        let mut raw = original.clone();
        raw.local_modes &= !(LocalModes::ICANON | LocalModes::ECHO | LocalModes::ISIG);
        raw.input_modes &= !InputModes::ICRNL;
        tcsetattr(stdin, OptionalActions::Now, &raw)
            .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;

        let mut out = std::io::stdout();
        out.write_all(ALT_SCREEN_ENTER.as_bytes())?;
        out.flush()?;

        Ok(Self { original, restored: false })
    }

    /// Leave the alternate screen and put the terminal back. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let mut out = std::io::stdout();
        let _ = out.write_all(b"\x1b[0m\x1b[?25h");
        let _ = out.write_all(ALT_SCREEN_LEAVE.as_bytes());
        let _ = out.flush();
        let _ = tcsetattr(rustix::stdio::stdin(), OptionalActions::Now, &self.original);
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current terminal geometry as `(rows, cols)`.
pub fn terminal_size() -> std::io::Result<(u16, u16)> {
    let ws = tcgetwinsize(rustix::stdio::stdout())
        .map_err(|e| std::io::Error::from_raw_os_error(e.raw_os_error()))?;
    Ok((ws.ws_row, ws.ws_col))
}
