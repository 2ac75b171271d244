//! muxkit - terminal multiplexer
//!
//! The one binary for both roles: invoked from a terminal it is the
//! front-end (and lazily forks the per-user server when none answers the
//! socket); the server keeps sessions and their shells alive across
//! detaches.
//!
//! # Usage
//!
//! ```text
//! muxkit              attach a new session to this terminal
//! muxkit -l           list sessions
//! muxkit -s <id>      attach to detached session <id>
//! muxkit -k <id>      kill session <id>
//! muxkit -n           create a detached session in the background
//! muxkit -h           show help
//! ```
//!
//! Logging is off unless `MUXKIT_LOG` holds a filter (e.g. `info` or
//! `client=debug`); it then appends to `client.log` / `server.log` in the
//! runtime directory.

use std::io::Write;

use client::ClientError;

const HELP: &str = "\
usage: muxkit [-l] [-s <id>] [-k <id>] [-n] [-h]

  (no arguments)        attach a new session to this terminal
  -l                    list sessions
  -s <id>               attach to detached session <id>
  -k <id>               kill session <id>
  -n, --new-session     create a detached session in the background
                        (also spelled `muxkit new-session`)
  -h, --help            show this help
";

fn main() {
    init_logging();
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None => cmd_attach_new(),
        Some("-l") => cmd_list(),
        Some("-s") => match parse_id(args.get(1)) {
            Some(id) => cmd_attach(id),
            None => usage_error("-s needs a session id"),
        },
        Some("-k") => match parse_id(args.get(1)) {
            Some(id) => cmd_kill(id),
            None => usage_error("-k needs a session id"),
        },
        Some("-h") | Some("--help") => {
            print!("{HELP}");
            0
        }
        Some("-n") | Some("--new-session") | Some("new-session") => cmd_new_detached(),
        Some(other) => usage_error(&format!("unknown argument: {other}")),
    }
}

fn parse_id(arg: Option<&String>) -> Option<u32> {
    arg.and_then(|s| s.parse().ok())
}

fn usage_error(message: &str) -> i32 {
    eprintln!("muxkit: {message}");
    eprint!("{HELP}");
    -1
}

fn connect() -> Result<std::os::unix::net::UnixStream, i32> {
    server::connect_or_spawn().map_err(|e| {
        eprintln!("muxkit: can't reach server: {e}");
        -1
    })
}

fn cmd_attach_new() -> i32 {
    if client::nesting_detected() {
        eprintln!("muxkit: sessions should not be nested; unset MUXKIT/TMUX to force");
        return -1;
    }

    let stream = match connect() {
        Ok(stream) => stream,
        Err(code) => return code,
    };
    let mut app = match client::App::new_session(stream) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("muxkit: {e}");
            return -1;
        }
    };
    finish(app.run())
}

fn cmd_attach(id: u32) -> i32 {
    let stream = match connect() {
        Ok(stream) => stream,
        Err(code) => return code,
    };
    let mut app = match client::App::attach(stream, id) {
        Ok(app) => app,
        // An invalid target is not a system error.
        Err(ClientError::AttachRefused { session }) => {
            println!("can't attach session {session}");
            return 0;
        }
        Err(e) => {
            eprintln!("muxkit: {e}");
            return -1;
        }
    };
    finish(app.run())
}

fn cmd_list() -> i32 {
    let stream = match connect() {
        Ok(stream) => stream,
        Err(code) => return code,
    };
    match client::list_sessions(stream) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("muxkit: {e}");
            -1
        }
    }
}

fn cmd_kill(id: u32) -> i32 {
    let stream = match connect() {
        Ok(stream) => stream,
        Err(code) => return code,
    };
    match client::kill_session(stream, id) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("muxkit: {e}");
            -1
        }
    }
}

fn cmd_new_detached() -> i32 {
    if client::nesting_detected() {
        eprintln!("muxkit: sessions should not be nested; unset MUXKIT/TMUX to force");
        return -1;
    }

    let stream = match connect() {
        Ok(stream) => stream,
        Err(code) => return code,
    };
    match client::create_detached_session(stream) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("muxkit: {e}");
            -1
        }
    }
}

fn finish(result: Result<(), ClientError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("muxkit: {e}");
            -1
        }
    }
}

/// Append to `client.log`, or `server.log` once the daemon has marked its
/// role. The writer re-resolves per event so the forked server picks up its
/// own file without replacing the inherited subscriber.
struct RoleLogWriter;

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RoleLogWriter {
    type Writer = Box<dyn Write>;

    fn make_writer(&'a self) -> Self::Writer {
        let name = if std::env::var("MUXKIT_ROLE").as_deref() == Ok("server") {
            "server.log"
        } else {
            "client.log"
        };
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(protocol::runtime_dir().join(name))
        {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(std::io::sink()),
        }
    }
}

fn init_logging() {
    let Ok(filter) = std::env::var("MUXKIT_LOG") else {
        return;
    };
    if filter.is_empty() {
        return;
    }
    let _ = protocol::ensure_runtime_dir();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(RoleLogWriter)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
