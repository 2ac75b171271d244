//! Accept loop and per-connection dispatch
//!
//! Single-threaded cooperative: one `poll` per iteration over the listening
//! socket and every connected front-end, a SIGCHLD flag checked on each
//! wake-up, and run-to-completion handlers. Within a connection, messages
//! are handled strictly in arrival order; the multi-phase attach reply is
//! one uninterruptible sequence against that connection's socket.

use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustix::event::{poll, PollFd, PollFlags};
use thiserror::Error;

use protocol::{
    decode_command, encode_grid_save, read_message, split_grid_save, write_full, write_message,
    write_u32_raw, write_u64_raw, MessageKind, ProtocolError, WindowSize, PROTOCOL_VERSION,
};

use crate::session::{PaneSlot, Session, MAX_PANES};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("poll failed: {0}")]
    Poll(rustix::io::Errno),
}

/// One connected front-end.
struct Connection {
    id: u64,
    stream: UnixStream,
    /// Session this connection is bound to, once it has issued a
    /// session-binding message.
    session: Option<u32>,
    /// Marked for removal at the end-of-iteration sweep.
    closing: bool,
}

/// The session server.
pub struct Server {
    listener: UnixListener,
    conns: Vec<Connection>,
    sessions: Vec<Session>,
    next_session_id: u32,
    next_conn_id: u64,
    sigchld: Arc<AtomicBool>,
    running: bool,
}

impl Server {
    /// Bind the per-user socket and prepare an empty session table.
    pub fn bind() -> Result<Self, ServerError> {
        protocol::ensure_runtime_dir()?;
        let path = protocol::socket_path();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        tracing::info!(?path, "server listening");
        Ok(Self::from_listener(listener))
    }

    /// Wrap an already-bound listener (the test harness uses this).
    pub fn from_listener(listener: UnixListener) -> Self {
        let _ = listener.set_nonblocking(true);
        Self {
            listener,
            conns: Vec::new(),
            sessions: Vec::new(),
            next_session_id: 0,
            next_conn_id: 0,
            sigchld: Arc::new(AtomicBool::new(false)),
            running: true,
        }
    }

    /// Install the SIGCHLD flag and serve until told to stop.
    pub fn run(&mut self) -> Result<(), ServerError> {
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&self.sigchld))?;
        while self.running {
            self.poll_once(-1)?;
        }
        Ok(())
    }

    /// One iteration of the readiness loop. `timeout_ms` of `-1` blocks.
    pub fn poll_once(&mut self, timeout_ms: i32) -> Result<(), ServerError> {
        let mut listener_ready = false;
        let mut ready = Vec::new();

        {
            let mut fds = Vec::with_capacity(1 + self.conns.len());
            fds.push(PollFd::new(&self.listener, PollFlags::IN));
            for conn in &self.conns {
                fds.push(PollFd::new(&conn.stream, PollFlags::IN));
            }

            match poll(&mut fds, timeout_ms) {
                Ok(_) => {
                    let wake = PollFlags::IN | PollFlags::HUP | PollFlags::ERR;
                    listener_ready = fds[0].revents().intersects(wake);
                    for (i, fd) in fds[1..].iter().enumerate() {
                        if fd.revents().intersects(wake) {
                            ready.push(i);
                        }
                    }
                }
                // A signal interrupted the wait; fall through to the flag
                // checks with nothing readable.
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(ServerError::Poll(e)),
            }
        }

        if self.sigchld.swap(false, Ordering::SeqCst) {
            self.reap_children();
        }

        if listener_ready {
            self.accept_clients();
        }

        for i in ready {
            let open = self.conns.get(i).map(|c| !c.closing).unwrap_or(false);
            if open {
                self.handle_readable(i);
            }
        }

        self.sweep_connections();
        Ok(())
    }

    /// Ask the run loop to exit after the current iteration.
    pub fn shutdown(&mut self) {
        self.running = false;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The flag the SIGCHLD handler sets. Embedders that drive `poll_once`
    /// themselves (the test harness) set it to force a reap sweep.
    pub fn sigchld_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sigchld)
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Per-message reads are blocking; only the accept is not.
                    let _ = stream.set_nonblocking(false);
                    let id = self.next_conn_id;
                    self.next_conn_id += 1;
                    tracing::debug!(conn = id, "client connected");
                    self.conns.push(Connection { id, stream, session: None, closing: false });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, i: usize) {
        let frame = match read_message(&mut self.conns[i].stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(conn = self.conns[i].id, "client disconnected");
                self.conns[i].closing = true;
                return;
            }
            Err(e) => {
                tracing::warn!(conn = self.conns[i].id, error = %e, "protocol error, dropping connection");
                self.conns[i].closing = true;
                return;
            }
        };

        match frame.kind {
            MessageKind::Version => self.handle_version(i, &frame.payload),
            MessageKind::Command => match decode_command(&frame.payload) {
                Ok(name) => {
                    let name = name.to_string();
                    self.handle_command(i, &name);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bad command payload");
                    self.conns[i].closing = true;
                }
            },
            MessageKind::Resize => self.handle_resize(i, &frame.payload),
            MessageKind::Detach => match frame.payload.len() {
                0 => self.handle_detach(i),
                4 => {
                    let target = u32::from_ne_bytes(frame.payload[..4].try_into().unwrap());
                    self.handle_attach(i, target);
                }
                n => {
                    tracing::warn!(len = n, "bad detach payload");
                    self.conns[i].closing = true;
                }
            },
            MessageKind::ListSessions => self.handle_list(i),
            MessageKind::DetachKill => {
                if frame.payload.len() == 4 {
                    let target = u32::from_ne_bytes(frame.payload[..4].try_into().unwrap());
                    self.handle_kill(i, target);
                } else {
                    tracing::warn!(len = frame.payload.len(), "bad kill payload");
                    self.conns[i].closing = true;
                }
            }
            MessageKind::Exited => {
                let pid = String::from_utf8_lossy(&frame.payload).into_owned();
                tracing::debug!(conn = self.conns[i].id, client_pid = %pid, "client exited");
                self.conns[i].closing = true;
            }
            MessageKind::GridSave => self.handle_grid_save(i, &frame.payload),
        }
    }

    fn handle_version(&mut self, i: usize, payload: &[u8]) {
        let conn = &mut self.conns[i];
        let Some(bytes) = payload.get(..4) else {
            tracing::warn!(conn = conn.id, "short version payload");
            conn.closing = true;
            return;
        };
        let client = u32::from_ne_bytes(bytes.try_into().unwrap());

        // The reply is a bare int on the wire, not a framed message.
        if write_u32_raw(&mut conn.stream, PROTOCOL_VERSION).is_err() {
            conn.closing = true;
            return;
        }
        if client != PROTOCOL_VERSION {
            tracing::warn!(client, server = PROTOCOL_VERSION, "protocol version mismatch");
            conn.closing = true;
        }
    }

    /// Bind the connection to its session, allocating one on first use.
    fn bind_session(&mut self, i: usize) -> u32 {
        if let Some(sid) = self.conns[i].session {
            return sid;
        }
        let sid = self.next_session_id;
        self.next_session_id += 1;

        let mut session = Session::new(sid);
        session.attached_conn = Some(self.conns[i].id);
        self.sessions.push(session);
        self.conns[i].session = Some(sid);
        tracing::info!(session = sid, "session created");
        sid
    }

    fn session_mut(&mut self, sid: u32) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == sid)
    }

    fn handle_command(&mut self, i: usize, name: &str) {
        if name != "new-session" && name != "pane-split" {
            tracing::warn!(command = %name, "unknown command ignored");
            return;
        }

        let sid = self.bind_session(i);
        let count = match self.session_mut(sid) {
            Some(session) => session.pane_count(),
            None => return,
        };
        if count >= MAX_PANES {
            tracing::warn!(session = sid, "pane limit reached, request ignored");
            return;
        }

        // Size is nominal; the front-end is authoritative and sets the real
        // per-pane size on its copy of the master.
        let pair = match terminal::pty::open_pty(80, 24) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "PTY creation failed, request dropped");
                return;
            }
        };

        // The master crosses to the front-end first; if the shell then fails
        // to spawn, dropping our copy hangs up the client's pane.
        if let Err(e) = protocol::fd::send_fd(&self.conns[i].stream, pair.master.as_fd()) {
            tracing::warn!(error = %e, "master transfer failed");
            self.conns[i].closing = true;
            return;
        }

        let child = match terminal::pty::spawn_shell_on(&pair.slave_path, std::process::id()) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "shell spawn failed, pane abandoned");
                return;
            }
        };

        if let Some(session) = self.session_mut(sid) {
            session.add_pane(PaneSlot { master: pair.master, child });
            tracing::info!(session = sid, panes = session.pane_count(), command = %name, "pane spawned");
        }
    }

    fn handle_resize(&mut self, i: usize, payload: &[u8]) {
        let ws = match WindowSize::decode(payload) {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(error = %e, "bad resize payload");
                self.conns[i].closing = true;
                return;
            }
        };
        let sid = self.bind_session(i);
        if let Some(session) = self.session_mut(sid) {
            session.last_resize = Some(ws);
        }
    }

    fn handle_detach(&mut self, i: usize) {
        let Some(sid) = self.conns[i].session else {
            tracing::warn!(conn = self.conns[i].id, "detach without a session");
            return;
        };
        if let Some(session) = self.session_mut(sid) {
            session.detached = true;
            session.attached_conn = None;
            tracing::info!(session = sid, "session detached");
        }
        // The sweep at the end of this iteration closes the connection.
        self.conns[i].closing = true;
    }

    fn handle_attach(&mut self, i: usize, target: u32) {
        let pos = self
            .sessions
            .iter()
            .position(|s| s.id == target && s.detached);

        let Some(pos) = pos else {
            // Unknown id or not detached: pane count zero signals failure.
            if write_u32_raw(&mut self.conns[i].stream, 0).is_err() {
                self.conns[i].closing = true;
            }
            tracing::info!(session = target, "attach refused");
            return;
        };

        let session = &mut self.sessions[pos];
        let conn = &mut self.conns[i];
        if let Err(e) = attach_transfer(session, &mut conn.stream) {
            tracing::warn!(session = target, error = %e, "attach transfer failed");
            conn.closing = true;
            return;
        }

        session.attached_conn = Some(conn.id);
        session.detached = false;
        conn.session = Some(target);
        tracing::info!(session = target, panes = session.pane_count(), "session attached");
    }

    fn handle_list(&mut self, i: usize) {
        let text = if self.sessions.is_empty() {
            "(no sessions)".to_string()
        } else {
            self.sessions
                .iter()
                .map(|s| {
                    format!(
                        "{}: {} (pid {})",
                        s.id,
                        if s.detached { "detached" } else { "attached" },
                        s.first_pid().unwrap_or(0),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let conn = &mut self.conns[i];
        let ok = write_u64_raw(&mut conn.stream, text.len() as u64)
            .and_then(|_| write_full(&mut conn.stream, text.as_bytes()));
        if ok.is_err() {
            tracing::warn!(conn = conn.id, "list reply failed");
        }
        conn.closing = true;
    }

    fn handle_kill(&mut self, i: usize, target: u32) {
        let text = match self.sessions.iter().position(|s| s.id == target) {
            Some(pos) => {
                let mut session = self.sessions.remove(pos);
                session.kill_all();
                if let Some(cid) = session.attached_conn {
                    if let Some(conn) = self.conns.iter_mut().find(|c| c.id == cid) {
                        conn.closing = true;
                    }
                }
                tracing::info!(session = target, "session killed");
                format!("killed session {target}")
            }
            None => format!("no such session {target}"),
        };

        let conn = &mut self.conns[i];
        let ok = write_u64_raw(&mut conn.stream, text.len() as u64)
            .and_then(|_| write_full(&mut conn.stream, text.as_bytes()));
        if ok.is_err() {
            tracing::warn!(conn = conn.id, "kill reply failed");
        }
        conn.closing = true;
    }

    fn handle_grid_save(&mut self, i: usize, payload: &[u8]) {
        let Some(sid) = self.conns[i].session else {
            tracing::warn!(conn = self.conns[i].id, "grid save without a session");
            return;
        };
        match split_grid_save(payload) {
            Ok((pane_id, data)) => {
                if let Some(session) = self.session_mut(sid) {
                    session.grid_cache.insert(pane_id, data.to_vec());
                    tracing::debug!(session = sid, pane = pane_id, bytes = data.len(), "grid cached");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "bad grid save payload");
                self.conns[i].closing = true;
            }
        }
    }

    /// Drain exited children, then tear down sessions whose last pane died.
    fn reap_children(&mut self) {
        let mut dead = Vec::new();
        for session in &mut self.sessions {
            let freed = session.reap();
            if freed > 0 {
                tracing::info!(session = session.id, freed, live = session.pane_count(), "reaped children");
            }
            if session.is_dead() {
                dead.push(session.id);
            }
        }

        for sid in dead {
            if let Some(pos) = self.sessions.iter().position(|s| s.id == sid) {
                let session = self.sessions.remove(pos);
                if let Some(cid) = session.attached_conn {
                    if let Some(conn) = self.conns.iter_mut().find(|c| c.id == cid) {
                        conn.closing = true;
                    }
                }
                tracing::info!(session = sid, "session torn down");
            }
        }
    }

    /// Remove connections marked closing and unbind them from sessions.
    fn sweep_connections(&mut self) {
        for conn in &self.conns {
            if !conn.closing {
                continue;
            }
            for session in &mut self.sessions {
                if session.attached_conn == Some(conn.id) {
                    session.attached_conn = None;
                }
            }
        }
        self.conns.retain(|c| !c.closing);
    }
}

/// The attach reply sequence: pane count, one fd per pane, snapshot count,
/// then each cached snapshot as a framed `GridSave`. The cache entries are
/// consumed.
fn attach_transfer(session: &mut Session, stream: &mut UnixStream) -> Result<(), ProtocolError> {
    write_u32_raw(stream, session.pane_count() as u32)?;
    for master in session.live_masters() {
        protocol::fd::send_fd(&*stream, master.as_fd())?;
    }

    let snapshots: Vec<(u32, Vec<u8>)> = session.grid_cache.drain().collect();
    write_u32_raw(stream, snapshots.len() as u32)?;
    for (pane_id, data) in snapshots {
        write_message(stream, MessageKind::GridSave, &encode_grid_save(pane_id, &data))?;
    }
    Ok(())
}
