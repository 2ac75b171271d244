//! Test fixtures for common scenarios

use std::fs::File;
use std::io::Read;
use std::os::fd::BorrowedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use server::Server;
use terminal::{Grid, Pane};

/// True when PTY- or fork-dependent tests should be skipped.
pub fn ci() -> bool {
    std::env::var("CI").is_ok()
}

/// A dispatcher running on a private socket in a background thread.
///
/// The loop forces a reap sweep every iteration, so child exits are
/// observed without signal delivery into the test process.
pub struct TestServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("default");
        let listener = UnixListener::bind(&path).expect("bind test socket");

        let mut srv = Server::from_listener(listener);
        let sigchld = srv.sigchld_flag();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                sigchld.store(true, Ordering::SeqCst);
                if srv.poll_once(25).is_err() {
                    break;
                }
            }
        });

        Self { path, stop, thread: Some(thread), _dir: dir }
    }

    /// A fresh connection, before any handshake.
    pub fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.path).expect("connect to test server")
    }

    /// A connection that has already completed the version exchange.
    pub fn connect_ready(&self) -> UnixStream {
        let mut stream = self.connect();
        client::handshake(&mut stream).expect("handshake");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A pane whose PTY slave the test holds: writing into the slave is
/// indistinguishable from shell output arriving on the master.
pub struct LoopbackPane {
    pub pane: Pane,
    pub slave: File,
}

impl LoopbackPane {
    pub fn new(id: u32, cols: u16, rows: u16) -> Self {
        let pair = terminal::pty::open_pty(cols, rows).expect("open pty");
        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pair.slave_path)
            .expect("open slave");
        let pane = Pane::new(id, cols, rows, 0, 0, pair.master);

        // The pump below reads without polling, so the master must not
        // block.
        let fd = unsafe { BorrowedFd::borrow_raw(pane.master_fd()) };
        let flags = rustix::fs::fcntl_getfl(fd).expect("getfl");
        rustix::fs::fcntl_setfl(fd, flags | rustix::fs::OFlags::NONBLOCK).expect("setfl");

        Self { pane, slave }
    }

    /// Drain whatever is pending on the master into the pane.
    pub fn pump(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.pane.read_master(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pane.handle_output(&buf[..n]).expect("pane feed"),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("master read failed: {e}"),
            }
        }
    }

    /// Pump until `predicate` holds or the timeout elapses.
    pub fn pump_until(&mut self, predicate: impl Fn(&Pane) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if predicate(&self.pane) {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// The visible text of one grid row, trailing blanks trimmed.
pub fn row_text(grid: &Grid, y: usize) -> String {
    grid.row(y)
        .iter()
        .map(|c| c.ch)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Read an exact number of bytes from a stream (test-side helper).
pub fn read_exact(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}
