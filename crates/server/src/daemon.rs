//! Lazy server daemonization
//!
//! The server is forked by the first client that fails to connect. An
//! exclusive advisory lock on `<socket>.lock` serializes the
//! check-unlink-fork sequence between racing clients; signals are fully
//! blocked across the fork. The forked child double-forks into a new
//! session, points stdio at the null device, and enters the accept loop.

use std::fs::File;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustix::fs::{flock, FlockOperation};

use crate::dispatch::Server;

/// Try the per-user socket once.
pub fn connect() -> std::io::Result<UnixStream> {
    UnixStream::connect(protocol::socket_path())
}

/// Connect to the server, forking one first if none answers.
pub fn connect_or_spawn() -> Result<UnixStream> {
    if let Ok(stream) = connect() {
        return Ok(stream);
    }

    fork_server().context("failed to start server")?;

    for _ in 0..100 {
        std::thread::sleep(Duration::from_millis(20));
        if let Ok(stream) = connect() {
            return Ok(stream);
        }
    }
    bail!("server did not come up");
}

/// Fork a server under the cooperative lock. Returns in the original
/// process once the intermediate child has been reaped; the daemon
/// grandchild never returns from here.
fn fork_server() -> Result<()> {
    protocol::ensure_runtime_dir().context("runtime directory")?;

    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(protocol::lock_path())
        .context("lock file")?;
    flock(&lock, FlockOperation::LockExclusive).context("lock")?;

    // Someone else may have won the race and brought a server up while we
    // waited on the lock; in that case the socket must not be unlinked.
    if connect().is_ok() {
        return Ok(());
    }
    let _ = std::fs::remove_file(protocol::socket_path());

    // Block everything across the fork; the daemon restores the mask once
    // it is on its own.
    let mut all: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut old: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigfillset(&mut all);
        libc::sigprocmask(libc::SIG_SETMASK, &all, &mut old);
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &old, std::ptr::null_mut());
        }
        bail!("fork failed: {}", std::io::Error::last_os_error());
    }

    if pid == 0 {
        daemonize_and_serve(lock, old);
    }

    // Original client: reap the intermediate child, restore signals, drop
    // our copy of the lock (the daemon holds its own until the socket is
    // bound).
    unsafe {
        let mut status = 0;
        libc::waitpid(pid, &mut status, 0);
        libc::sigprocmask(libc::SIG_SETMASK, &old, std::ptr::null_mut());
    }
    Ok(())
}

/// First-fork child: become a daemon and serve forever.
fn daemonize_and_serve(lock: File, old_mask: libc::sigset_t) -> ! {
    unsafe {
        libc::setsid();

        // Second fork so the daemon is not a session leader and can never
        // reacquire a controlling terminal.
        let pid = libc::fork();
        if pid != 0 {
            libc::_exit(0);
        }

        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());

        // Lets the shared logging writer route this process to server.log.
        std::env::set_var("MUXKIT_ROLE", "server");

        let null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }

    let code = match Server::bind() {
        Ok(mut server) => {
            // The socket exists; racing clients may proceed.
            drop(lock);
            match server.run() {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "server loop failed");
                    1
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "server bind failed");
            1
        }
    };
    std::process::exit(code);
}
