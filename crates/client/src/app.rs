//! Front-end application
//!
//! Owns the controlling terminal and the connection to the server, drives
//! the state machine over one readiness wait per iteration, and implements
//! the startup flows (new session, attach) plus the administrative requests
//! (list, kill, background session creation).

use std::io::{Read, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustix::event::{poll, PollFd, PollFlags};
use thiserror::Error;

use protocol::{
    encode_command, encode_grid_save, read_message, read_u32_raw, read_u64_raw, split_grid_save,
    write_message, MessageKind, ProtocolError, WindowSize, PROTOCOL_VERSION,
};
use terminal::pane::PaneError;
use terminal::Pane;

use crate::fsm::{self, Action, FsmEvent, State};
use crate::keybinds::{Keybinds, PrefixAction, PREFIX_KEY};
use crate::render::render_window;
use crate::term::{terminal_size, RawTerminal};
use crate::window::{layout, Window};

/// Rows scrolled per scroll-up/scroll-down keystroke.
const SCROLL_STEP: usize = 1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("pane error: {0}")]
    Pane(#[from] PaneError),

    #[error("server speaks protocol version {server}, this client speaks {PROTOCOL_VERSION}")]
    VersionMismatch { server: u32 },

    #[error("can't attach session {session}")]
    AttachRefused { session: u32 },

    #[error("refusing to run inside another terminal multiplexer (MUXKIT or TMUX is set)")]
    NestingRefused,

    #[error("poll failed: {0}")]
    Poll(rustix::io::Errno),
}

/// True when we are already inside a multiplexer.
pub fn nesting_detected() -> bool {
    ["MUXKIT", "TMUX"]
        .iter()
        .any(|key| std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false))
}

/// Open every connection with the version exchange. The server's reply is a
/// bare int on the wire.
pub fn handshake(stream: &mut UnixStream) -> Result<(), ClientError> {
    write_message(stream, MessageKind::Version, &PROTOCOL_VERSION.to_ne_bytes())?;
    let server = read_u32_raw(stream)?;
    if server != PROTOCOL_VERSION {
        return Err(ClientError::VersionMismatch { server });
    }
    Ok(())
}

fn send_resize(stream: &mut UnixStream, rows: u16, cols: u16) -> Result<(), ProtocolError> {
    let ws = WindowSize { rows, cols, xpixel: 0, ypixel: 0 };
    write_message(stream, MessageKind::Resize, &ws.encode())
}

/// Fetch the session listing. The connection is spent afterwards.
pub fn list_sessions(mut stream: UnixStream) -> Result<String, ClientError> {
    handshake(&mut stream)?;
    write_message(&mut stream, MessageKind::ListSessions, &[])?;
    read_text_reply(&mut stream)
}

/// Kill a session by id and return the server's status line.
pub fn kill_session(mut stream: UnixStream, session_id: u32) -> Result<String, ClientError> {
    handshake(&mut stream)?;
    write_message(&mut stream, MessageKind::DetachKill, &session_id.to_ne_bytes())?;
    read_text_reply(&mut stream)
}

fn read_text_reply(stream: &mut UnixStream) -> Result<String, ClientError> {
    let len = read_u64_raw(stream)? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).map_err(ProtocolError::Io)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `new-session` / `-n`: fork into the background and create a session that
/// is immediately detached. The parent returns at once; the child drives
/// the protocol on its copy of the connection and exits.
pub fn create_detached_session(stream: UnixStream) -> Result<(), ClientError> {
    if nesting_detected() {
        return Err(ClientError::NestingRefused);
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ClientError::Io(std::io::Error::last_os_error()));
    }
    if pid > 0 {
        return Ok(());
    }

    unsafe {
        libc::setsid();
    }
    let code = match create_detached_inner(stream) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "background session creation failed");
            1
        }
    };
    std::process::exit(code);
}

fn create_detached_inner(mut stream: UnixStream) -> Result<(), ClientError> {
    handshake(&mut stream)?;
    let (rows, cols) = terminal_size().unwrap_or((24, 80));
    let (sx, sy, _, _) = layout(rows, cols, 1)[0];
    send_resize(&mut stream, sy, sx)?;
    write_message(&mut stream, MessageKind::Command, &encode_command("new-session"))?;
    // Our copy of the master closes right away; the server keeps the pane
    // alive for the eventual attach.
    drop(protocol::fd::recv_fd(&stream)?);
    write_message(&mut stream, MessageKind::Detach, &[])?;
    Ok(())
}

/// The attached front-end.
pub struct App {
    stream: UnixStream,
    window: Window,
    state: State,
    raw: Option<RawTerminal>,
    bindings: Keybinds,
    prefix_armed: bool,
    /// Wired through to a cursor-shape escape; nothing can set it.
    sync_input: bool,
    rows: u16,
    cols: u16,
    winch: Arc<AtomicBool>,
    chld: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    sent_detach: bool,
    dirty: bool,
}

impl App {
    fn from_parts(stream: UnixStream, window: Window, rows: u16, cols: u16) -> Self {
        Self {
            stream,
            window,
            state: State::Boot,
            raw: None,
            bindings: Keybinds::load(&protocol::keybinds_path()),
            prefix_armed: false,
            sync_input: false,
            rows,
            cols,
            winch: Arc::new(AtomicBool::new(false)),
            chld: Arc::new(AtomicBool::new(false)),
            interrupt: Arc::new(AtomicBool::new(false)),
            sent_detach: false,
            dirty: false,
        }
    }

    /// Startup flow for a fresh session on the current terminal.
    pub fn new_session(mut stream: UnixStream) -> Result<Self, ClientError> {
        if nesting_detected() {
            return Err(ClientError::NestingRefused);
        }
        handshake(&mut stream)?;

        let (rows, cols) = terminal_size()?;
        let (sx, sy, xoff, yoff) = layout(rows, cols, 1)[0];
        send_resize(&mut stream, sy, sx)?;
        write_message(&mut stream, MessageKind::Command, &encode_command("new-session"))?;
        let master = protocol::fd::recv_fd(&stream)?;

        let mut window = Window::new("muxkit");
        let id = window.take_pane_id();
        let mut pane = Pane::new(id, sx, sy, xoff, yoff, master);
        pane.resize(sx, sy, xoff, yoff)?;
        window.panes.push(pane);

        Ok(Self::from_parts(stream, window, rows, cols))
    }

    /// Startup flow for reattaching a detached session.
    pub fn attach(mut stream: UnixStream, session_id: u32) -> Result<Self, ClientError> {
        handshake(&mut stream)?;
        write_message(&mut stream, MessageKind::Detach, &session_id.to_ne_bytes())?;

        let count = read_u32_raw(&mut stream)?;
        if count == 0 {
            return Err(ClientError::AttachRefused { session: session_id });
        }

        let mut masters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            masters.push(protocol::fd::recv_fd(&stream)?);
        }

        let (rows, cols) = terminal_size()?;
        let geometry = layout(rows, cols, count as usize);
        let mut window = Window::new("muxkit");
        for (master, (sx, sy, xoff, yoff)) in masters.into_iter().zip(geometry) {
            let id = window.take_pane_id();
            let mut pane = Pane::new(id, sx, sy, xoff, yoff, master);
            pane.resize(sx, sy, xoff, yoff)?;
            window.panes.push(pane);
        }

        let snapshots = read_u32_raw(&mut stream)?;
        for _ in 0..snapshots {
            let frame = read_message(&mut stream)?.ok_or(ProtocolError::Truncated)?;
            if frame.kind != MessageKind::GridSave {
                tracing::warn!(kind = ?frame.kind, "unexpected frame in attach sequence");
                continue;
            }
            let (pane_id, data) = split_grid_save(&frame.payload)?;
            match window.panes.iter_mut().find(|p| p.id == pane_id) {
                Some(pane) => {
                    if let Err(e) = pane.restore(data) {
                        tracing::warn!(pane = pane_id, error = %e, "snapshot replay failed");
                    }
                }
                None => tracing::warn!(pane = pane_id, "snapshot for unknown pane dropped"),
            }
        }

        Ok(Self::from_parts(stream, window, rows, cols))
    }

    /// Enter raw mode and serve events until an exit transition fires.
    pub fn run(&mut self) -> Result<(), ClientError> {
        signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&self.winch))?;
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&self.chld))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.interrupt))?;

        if let Some(Action::EnterRawMode) = self.advance(FsmEvent::EnableRawMode) {
            self.raw = Some(RawTerminal::enter()?);
        }
        self.clear_and_render()?;

        while self.state == State::Running {
            self.pump()?;
        }

        self.finish();
        Ok(())
    }

    /// Feed one event through the transition table.
    fn advance(&mut self, event: FsmEvent) -> Option<Action> {
        match fsm::lookup(self.state, event) {
            Some((next, action)) => {
                self.state = next;
                action
            }
            None => {
                tracing::debug!(state = ?self.state, ?event, "event without transition ignored");
                None
            }
        }
    }

    /// One iteration: wait for readiness, then handle pending signal flags,
    /// the server link, pane output, and keyboard input, in that order.
    fn pump(&mut self) -> Result<(), ClientError> {
        let mut stdin_ready = false;
        let mut link_ready = false;
        let mut ready_panes = Vec::new();

        {
            let stdin = rustix::stdio::stdin();
            let pane_fds: Vec<BorrowedFd<'_>> =
                self.window.panes.iter().map(|p| p.master_as_fd()).collect();

            let mut fds = Vec::with_capacity(2 + pane_fds.len());
            fds.push(PollFd::new(&stdin, PollFlags::IN));
            fds.push(PollFd::new(&self.stream, PollFlags::IN));
            for fd in &pane_fds {
                fds.push(PollFd::new(fd, PollFlags::IN));
            }

            match poll(&mut fds, -1) {
                Ok(_) => {
                    let wake = PollFlags::IN | PollFlags::HUP | PollFlags::ERR;
                    stdin_ready = fds[0].revents().intersects(wake);
                    link_ready = fds[1].revents().intersects(wake);
                    for (i, fd) in fds[2..].iter().enumerate() {
                        if fd.revents().intersects(wake) {
                            ready_panes.push(i);
                        }
                    }
                }
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(ClientError::Poll(e)),
            }
        }

        if self.winch.swap(false, Ordering::SeqCst) {
            if let Some(Action::Resize) = self.advance(FsmEvent::Winch) {
                self.handle_resize()?;
            }
        }
        if self.chld.swap(false, Ordering::SeqCst) {
            if let Some(Action::RestoreTerminal) = self.advance(FsmEvent::ChldExit) {
                self.restore_terminal();
            }
            return Ok(());
        }
        if self.interrupt.swap(false, Ordering::SeqCst) {
            self.advance(FsmEvent::Interrupt);
            return Ok(());
        }

        if link_ready {
            match read_message(&mut self.stream) {
                Ok(Some(frame)) => {
                    tracing::debug!(kind = ?frame.kind, "unsolicited server frame ignored");
                }
                Ok(None) | Err(_) => {
                    if let Some(Action::RestoreTerminal) = self.advance(FsmEvent::EofPty) {
                        self.restore_terminal();
                    }
                    return Ok(());
                }
            }
        }

        self.service_panes(&ready_panes)?;
        if self.state != State::Running {
            return Ok(());
        }

        if stdin_ready {
            let mut buf = [0u8; 512];
            match rustix::io::read(rustix::stdio::stdin(), &mut buf) {
                Ok(0) => {
                    self.advance(FsmEvent::EofStdin);
                    return Ok(());
                }
                Ok(n) => {
                    if let Some(Action::HandleKeys) = self.advance(FsmEvent::StdinRead) {
                        let bytes: Vec<u8> = buf[..n].to_vec();
                        self.handle_keys(&bytes)?;
                    }
                }
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(ClientError::Io(std::io::Error::from_raw_os_error(
                    e.raw_os_error(),
                ))),
            }
        }

        if self.dirty && self.state == State::Running {
            self.dirty = false;
            self.render()?;
        }
        Ok(())
    }

    /// Read every ready pane master; feed live panes, remove dead ones.
    fn service_panes(&mut self, ready: &[usize]) -> Result<(), ClientError> {
        let mut dead = Vec::new();
        let mut buf = [0u8; 4096];

        for &idx in ready {
            if idx >= self.window.panes.len() {
                continue;
            }
            let result = self.window.panes[idx].read_master(&mut buf);
            match result {
                Ok(0) => dead.push(idx),
                Ok(n) => {
                    if let Some(Action::FeedPane) = self.advance(FsmEvent::PtyRead) {
                        if let Err(e) = self.window.panes[idx].handle_output(&buf[..n]) {
                            tracing::warn!(pane = idx, error = %e, "pane feed failed");
                        }
                        self.dirty = true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => dead.push(idx),
            }
        }

        if dead.is_empty() {
            return Ok(());
        }

        dead.sort_unstable();
        for &idx in dead.iter().rev() {
            tracing::info!(pane = idx, "pane closed");
            self.window.remove_pane(idx);
        }

        if self.window.panes.is_empty() {
            if let Some(Action::RestoreTerminal) = self.advance(FsmEvent::ChldExit) {
                self.restore_terminal();
            }
            return Ok(());
        }

        self.window.apply_layout(self.rows, self.cols);
        self.clear_and_render()?;
        Ok(())
    }

    /// Prefix-key dispatch over a batch of keyboard bytes.
    fn handle_keys(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        for &byte in bytes {
            if self.state != State::Running {
                break;
            }

            if self.prefix_armed {
                self.prefix_armed = false;

                if byte == PREFIX_KEY {
                    // Prefix twice sends the literal prefix byte through.
                    self.forward(&[PREFIX_KEY]);
                    continue;
                }

                // Alphabetic keys are lowercased before lookup; symbols like
                // `%` match literally, which is why shifted symbols work.
                let key = if byte.is_ascii_alphabetic() { byte.to_ascii_lowercase() } else { byte };
                match self.bindings.lookup(key) {
                    Some(PrefixAction::DetachSession) => {
                        if let Some(Action::SnapshotAndDetach) = self.advance(FsmEvent::Detached) {
                            self.snapshot_and_detach()?;
                        }
                        return Ok(());
                    }
                    Some(PrefixAction::NewPane) => {
                        if let Some(Action::Split) = self.advance(FsmEvent::PaneSplit) {
                            self.split()?;
                        }
                    }
                    Some(PrefixAction::NextPane) => {
                        self.window.next_pane();
                        self.dirty = true;
                    }
                    Some(PrefixAction::ScrollUp) => {
                        if let Some(pane) = self.window.active_pane() {
                            pane.scroll_up(SCROLL_STEP);
                            self.dirty = true;
                        }
                    }
                    Some(PrefixAction::ScrollDown) => {
                        if let Some(pane) = self.window.active_pane() {
                            pane.scroll_down(SCROLL_STEP);
                            self.dirty = true;
                        }
                    }
                    None => {
                        // Unbound: the prefix and the key go to the shell.
                        self.forward(&[PREFIX_KEY, byte]);
                    }
                }
                continue;
            }

            if byte == PREFIX_KEY {
                self.prefix_armed = true;
                continue;
            }

            // Any plain keystroke leaves history mode; Escape and `q` are
            // swallowed in the process.
            let was_in_history = self
                .window
                .active_pane()
                .map(|p| p.in_history())
                .unwrap_or(false);
            if was_in_history {
                if let Some(pane) = self.window.active_pane() {
                    pane.exit_history();
                }
                self.dirty = true;
                if byte == 0x1b || byte == b'q' {
                    continue;
                }
            }

            self.forward(&[byte]);
        }
        Ok(())
    }

    fn forward(&mut self, bytes: &[u8]) {
        if let Some(pane) = self.window.active_pane() {
            if let Err(e) = pane.write_input(bytes) {
                tracing::warn!(error = %e, "input write failed");
            }
        }
    }

    /// Terminal geometry changed: re-layout, repaint, tell the server.
    fn handle_resize(&mut self) -> Result<(), ClientError> {
        let (rows, cols) = terminal_size()?;
        self.rows = rows;
        self.cols = cols;
        self.window.apply_layout(rows, cols);
        self.clear_and_render()?;
        // Informational; the server caches it and nothing more.
        if let Err(e) = send_resize(&mut self.stream, rows, cols) {
            tracing::warn!(error = %e, "resize report failed");
        }
        Ok(())
    }

    /// Split: announce the post-split size, ask for a pane, receive its
    /// master, shrink the incumbents, and append the new pane.
    fn split(&mut self) -> Result<(), ClientError> {
        let count = self.window.panes.len() + 1;
        let geometry = layout(self.rows, self.cols, count);
        let (sx, sy, xoff, yoff) = geometry[count - 1];

        send_resize(&mut self.stream, sy, sx)?;
        write_message(&mut self.stream, MessageKind::Command, &encode_command("pane-split"))?;
        let master = protocol::fd::recv_fd(&self.stream)?;

        for (pane, (sx, sy, xoff, yoff)) in self.window.panes.iter_mut().zip(&geometry) {
            if let Err(e) = pane.resize(*sx, *sy, *xoff, *yoff) {
                tracing::warn!(pane = pane.id, error = %e, "pane shrink failed");
            }
        }

        let id = self.window.take_pane_id();
        let mut pane = Pane::new(id, sx, sy, xoff, yoff, master);
        pane.resize(sx, sy, xoff, yoff)?;
        self.window.panes.push(pane);

        self.clear_and_render()?;
        Ok(())
    }

    /// Detach: ship every pane's grid, then the detach request itself.
    fn snapshot_and_detach(&mut self) -> Result<(), ClientError> {
        for pane in &self.window.panes {
            let snapshot = pane.snapshot();
            write_message(
                &mut self.stream,
                MessageKind::GridSave,
                &encode_grid_save(pane.id, &snapshot),
            )?;
        }
        write_message(&mut self.stream, MessageKind::Detach, &[])?;
        self.sent_detach = true;
        self.restore_terminal();
        Ok(())
    }

    fn restore_terminal(&mut self) {
        if let Some(raw) = &mut self.raw {
            raw.restore();
        }
    }

    /// Final housekeeping on any exit path.
    fn finish(&mut self) {
        if !self.sent_detach {
            let pid = std::process::id().to_string();
            let _ = write_message(&mut self.stream, MessageKind::Exited, pid.as_bytes());
        }
        self.restore_terminal();
    }

    fn render(&mut self) -> Result<(), ClientError> {
        let program = render_window(&self.window, self.rows, self.cols, self.sync_input);
        let mut out = std::io::stdout();
        out.write_all(program.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    fn clear_and_render(&mut self) -> Result<(), ClientError> {
        let mut out = std::io::stdout();
        out.write_all(b"\x1b[2J")?;
        out.flush()?;
        self.render()
    }
}
