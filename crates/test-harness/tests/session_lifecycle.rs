//! Server session lifecycle over the wire
//!
//! Drives the dispatcher through real socket connections: handshake,
//! listing, attach misses, and (outside CI) the full
//! create → detach → reattach → kill arc with live shells.

use std::io::Read;
use std::time::{Duration, Instant};

use protocol::{
    encode_command, encode_grid_save, read_u32_raw, read_u64_raw, write_message, MessageKind,
    WindowSize, PROTOCOL_VERSION,
};
use test_harness::fixtures::read_exact;
use test_harness::{ci, TestServer};

fn text_reply(stream: &mut std::os::unix::net::UnixStream) -> String {
    let len = read_u64_raw(stream).unwrap() as usize;
    String::from_utf8(read_exact(stream, len)).unwrap()
}

fn list(server: &TestServer) -> String {
    let mut stream = server.connect_ready();
    write_message(&mut stream, MessageKind::ListSessions, &[]).unwrap();
    text_reply(&mut stream)
}

/// Poll the listing until it matches; connections are cheap.
fn wait_for_list(server: &TestServer, pred: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let text = list(server);
        if pred(&text) || Instant::now() > deadline {
            return text;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn version_handshake_succeeds() {
    let server = TestServer::start();
    let _stream = server.connect_ready();
}

#[test]
fn version_mismatch_gets_reply_then_eof() {
    let server = TestServer::start();
    let mut stream = server.connect();

    write_message(&mut stream, MessageKind::Version, &99u32.to_ne_bytes()).unwrap();
    // The reply is the server's version, raw on the wire.
    assert_eq!(read_u32_raw(&mut stream).unwrap(), PROTOCOL_VERSION);

    // Then the server hangs up; no session was created.
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert_eq!(list(&server), "(no sessions)");
}

#[test]
fn empty_listing() {
    let server = TestServer::start();
    assert_eq!(list(&server), "(no sessions)");
}

#[test]
fn kill_unknown_session() {
    let server = TestServer::start();
    let mut stream = server.connect_ready();
    write_message(&mut stream, MessageKind::DetachKill, &7u32.to_ne_bytes()).unwrap();
    assert_eq!(text_reply(&mut stream), "no such session 7");
}

#[test]
fn attach_unknown_session_reports_zero_panes() {
    let server = TestServer::start();
    let mut stream = server.connect_ready();
    write_message(&mut stream, MessageKind::Detach, &42u32.to_ne_bytes()).unwrap();
    assert_eq!(read_u32_raw(&mut stream).unwrap(), 0);
}

#[test]
fn attach_refused_while_still_attached() {
    if ci() {
        return;
    }
    let server = TestServer::start();

    let mut first = server.connect_ready();
    let ws = WindowSize { rows: 23, cols: 80, ..WindowSize::default() };
    write_message(&mut first, MessageKind::Resize, &ws.encode()).unwrap();
    write_message(&mut first, MessageKind::Command, &encode_command("new-session")).unwrap();
    let _master = protocol::fd::recv_fd(&first).unwrap();
    wait_for_list(&server, |t| t.starts_with("0: attached"));

    // Still attached: the attach request must be refused.
    let mut second = server.connect_ready();
    write_message(&mut second, MessageKind::Detach, &0u32.to_ne_bytes()).unwrap();
    assert_eq!(read_u32_raw(&mut second).unwrap(), 0);
}

#[test]
fn create_detach_reattach_kill() {
    if ci() {
        return;
    }
    let server = TestServer::start();

    // Create a session with one pane.
    let mut first = server.connect_ready();
    let ws = WindowSize { rows: 23, cols: 80, ..WindowSize::default() };
    write_message(&mut first, MessageKind::Resize, &ws.encode()).unwrap();
    write_message(&mut first, MessageKind::Command, &encode_command("new-session")).unwrap();
    let master = protocol::fd::recv_fd(&first).unwrap();

    let text = wait_for_list(&server, |t| t.starts_with("0: attached"));
    assert!(text.starts_with("0: attached (pid "), "listing was {text:?}");

    // Ship a snapshot, then detach.
    let grid = terminal::Grid::new(5, 2, 4);
    let snapshot = terminal::snapshot::serialize(&grid, 0, (1, 1));
    write_message(&mut first, MessageKind::GridSave, &encode_grid_save(0, &snapshot)).unwrap();
    write_message(&mut first, MessageKind::Detach, &[]).unwrap();
    drop(first);
    drop(master);

    let text = wait_for_list(&server, |t| t.starts_with("0: detached"));
    assert!(text.starts_with("0: detached"), "listing was {text:?}");

    // Reattach: one master, then the cached snapshot, then the session is
    // attached again.
    let mut second = server.connect_ready();
    write_message(&mut second, MessageKind::Detach, &0u32.to_ne_bytes()).unwrap();
    assert_eq!(read_u32_raw(&mut second).unwrap(), 1);
    let master2 = protocol::fd::recv_fd(&second).unwrap();
    assert_eq!(read_u32_raw(&mut second).unwrap(), 1);

    let frame = protocol::read_message(&mut second).unwrap().unwrap();
    assert_eq!(frame.kind, MessageKind::GridSave);
    let (pane_id, data) = protocol::split_grid_save(&frame.payload).unwrap();
    assert_eq!(pane_id, 0);
    let (_, cursor, restored) = terminal::snapshot::deserialize(data).unwrap();
    assert_eq!(cursor, (1, 1));
    assert_eq!(restored.width(), 5);

    wait_for_list(&server, |t| t.starts_with("0: attached"));

    // A second attach must not see the snapshot again (it was consumed),
    // and kill must remove the session entirely.
    drop(master2);
    let mut admin = server.connect_ready();
    write_message(&mut admin, MessageKind::DetachKill, &0u32.to_ne_bytes()).unwrap();
    assert_eq!(text_reply(&mut admin), "killed session 0");

    let text = wait_for_list(&server, |t| t == "(no sessions)");
    assert_eq!(text, "(no sessions)");
}

#[test]
fn all_shells_exiting_tears_the_session_down() {
    if ci() {
        return;
    }
    let server = TestServer::start();

    let mut conn = server.connect_ready();
    let ws = WindowSize { rows: 23, cols: 80, ..WindowSize::default() };
    write_message(&mut conn, MessageKind::Resize, &ws.encode()).unwrap();
    write_message(&mut conn, MessageKind::Command, &encode_command("new-session")).unwrap();
    let master = protocol::fd::recv_fd(&conn).unwrap();
    wait_for_list(&server, |t| t.starts_with("0:"));

    // Ask the shell to exit; the server reaps it and frees the session.
    use std::io::Write;
    let mut master = std::fs::File::from(master);
    master.write_all(b"exit\n").unwrap();

    let text = wait_for_list(&server, |t| t == "(no sessions)");
    assert_eq!(text, "(no sessions)");
}

#[test]
fn session_ids_are_not_reused() {
    if ci() {
        return;
    }
    let server = TestServer::start();

    for expected in ["0: attached", "1: attached"] {
        let mut conn = server.connect_ready();
        let ws = WindowSize { rows: 23, cols: 80, ..WindowSize::default() };
        write_message(&mut conn, MessageKind::Resize, &ws.encode()).unwrap();
        write_message(&mut conn, MessageKind::Command, &encode_command("new-session")).unwrap();
        let _master = protocol::fd::recv_fd(&conn).unwrap();
        wait_for_list(&server, |t| t.contains(expected));

        let mut admin = server.connect_ready();
        let id: u32 = expected.split(':').next().unwrap().parse().unwrap();
        write_message(&mut admin, MessageKind::DetachKill, &id.to_ne_bytes()).unwrap();
        let _ = text_reply(&mut admin);
        wait_for_list(&server, |t| t == "(no sessions)");
    }
}
