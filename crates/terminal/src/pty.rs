//! PTY creation and shell spawning (server side)
//!
//! The server creates the PTY pair, binds a shell to the slave as its
//! controlling terminal, and keeps the master. Front-ends get their own copy
//! of the master by descriptor passing and never touch the slave.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use rustix::termios::{tcsetwinsize, Winsize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(std::io::Error),

    #[error("failed to spawn shell: {0}")]
    Spawn(std::io::Error),

    #[error("failed to set window size: {0}")]
    Winsize(rustix::io::Errno),
}

/// A spawned shell bound to a fresh PTY.
pub struct ShellChild {
    /// Server-side master descriptor.
    pub master: OwnedFd,
    /// The shell process, reaped by the session engine.
    pub child: Child,
}

impl ShellChild {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

fn errno_to_io(errno: rustix::io::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno.raw_os_error())
}

/// Pick the user's shell: `$SHELL`, then the passwd entry, then `/bin/sh`.
pub fn resolve_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }

    // SAFETY: getpwuid returns a pointer into static libc storage (or null);
    // it is read immediately, before any other passwd call can overwrite it.
    unsafe {
        let entry = libc::getpwuid(libc::getuid());
        if !entry.is_null() {
            let shell = (*entry).pw_shell;
            if !shell.is_null() {
                if let Ok(s) = std::ffi::CStr::from_ptr(shell).to_str() {
                    if !s.is_empty() {
                        return s.to_string();
                    }
                }
            }
        }
    }

    "/bin/sh".to_string()
}

/// An opened PTY pair whose shell has not been spawned yet.
///
/// The master can be handed to a front-end before the child exists; the
/// slave path stays valid for as long as this value lives.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave_path: String,
}

/// Create a PTY pair: open and unlock the master, resolve the slave path,
/// and set the initial window size.
pub fn open_pty(cols: u16, rows: u16) -> Result<PtyPair, PtyError> {
    let winsize = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };

    let master =
        rustix::pty::openpt(rustix::pty::OpenptFlags::RDWR | rustix::pty::OpenptFlags::NOCTTY)
            .map_err(|e| PtyError::Open(errno_to_io(e)))?;
    rustix::pty::grantpt(&master).map_err(|e| PtyError::Open(errno_to_io(e)))?;
    rustix::pty::unlockpt(&master).map_err(|e| PtyError::Open(errno_to_io(e)))?;

    let slave_name_buf = [0u8; 256];
    let slave_name = rustix::pty::ptsname(&master, slave_name_buf)
        .map_err(|e| PtyError::Open(errno_to_io(e)))?;
    let slave_path = slave_name
        .to_str()
        .map_err(|_| {
            PtyError::Open(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid PTY slave name",
            ))
        })?
        .to_string();

    tcsetwinsize(&master, winsize).map_err(PtyError::Winsize)?;

    Ok(PtyPair { master, slave_path })
}

/// Spawn the user's shell on the slave side of an opened pair.
///
/// The child becomes a session leader with the slave as its controlling
/// terminal, inherits `TERM=xterm-256color` and `MUXKIT=<server pid>`, and
/// closes every descriptor above stderr before exec so no server socket or
/// foreign master leaks into user shells.
pub fn spawn_shell_on(slave_path: &str, server_pid: u32) -> Result<Child, PtyError> {
    let slave = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(slave_path)
        .map_err(PtyError::Open)?;

    // Each Stdio must own a distinct descriptor.
    let slave_fd = slave.as_raw_fd();
    let slave_fd_out = unsafe { libc::dup(slave_fd) };
    let slave_fd_err = unsafe { libc::dup(slave_fd) };
    if slave_fd_out < 0 || slave_fd_err < 0 {
        unsafe {
            if slave_fd_out >= 0 {
                libc::close(slave_fd_out);
            }
        }
        return Err(PtyError::Open(std::io::Error::last_os_error()));
    }

    let shell = resolve_shell();
    let mut cmd = Command::new(&shell);
    cmd.env("TERM", "xterm-256color")
        .env("MUXKIT", server_pid.to_string());

    let slave_fd_in = slave.into_raw_fd();

    let child = unsafe {
        cmd.stdin(Stdio::from_raw_fd(slave_fd_in))
            .stdout(Stdio::from_raw_fd(slave_fd_out))
            .stderr(Stdio::from_raw_fd(slave_fd_err))
            .pre_exec(|| {
                // New session with the slave (now stdin) as the controlling
                // terminal, then drop every inherited descriptor above
                // stderr.
                libc::setsid();
                libc::ioctl(0, libc::TIOCSCTTY, 0);
                for fd in 3..1024 {
                    libc::close(fd);
                }
                Ok(())
            })
            .spawn()
            .map_err(PtyError::Spawn)?
    };

    Ok(child)
}

/// Convenience for the common path: open a pair and spawn the shell on it.
pub fn spawn_shell(cols: u16, rows: u16, server_pid: u32) -> Result<ShellChild, PtyError> {
    let pair = open_pty(cols, rows)?;
    let child = spawn_shell_on(&pair.slave_path, server_pid)?;
    Ok(ShellChild { master: pair.master, child })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn resolve_shell_never_empty() {
        assert!(!resolve_shell().is_empty());
    }

    #[test]
    fn can_spawn_shell() {
        // Needs a working PTY, skip in CI if not available.
        if std::env::var("CI").is_ok() {
            return;
        }

        let shell = spawn_shell(80, 24, std::process::id());
        assert!(shell.is_ok());
        let mut shell = shell.unwrap();
        shell.child.kill().ok();
        shell.child.wait().ok();
    }

    #[test]
    fn spawned_shell_sees_muxkit_env() {
        if std::env::var("CI").is_ok() {
            return;
        }

        let mut shell = spawn_shell(80, 24, 4242).unwrap();
        let mut master = std::fs::File::from(shell.master);
        master.write_all(b"echo MARK=$MUXKIT\n").unwrap();

        let mut output = String::new();
        let mut buf = [0u8; 1024];
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(20));
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if output.contains("MARK=4242") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        shell.child.kill().ok();
        shell.child.wait().ok();
        assert!(output.contains("MARK=4242"), "got: {output}");
    }
}
