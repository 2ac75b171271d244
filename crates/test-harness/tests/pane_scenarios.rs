//! Pane-level scenarios
//!
//! The front-end behaviors that matter for detach transparency, exercised
//! through loopback PTYs (the test holds the slave, so "shell output" is
//! deterministic). All of these need a working /dev/pts and skip under CI.

use std::fs::File;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use client::window::{layout, Window};
use terminal::Pane;
use test_harness::fixtures::row_text;
use test_harness::{ci, LoopbackPane};

#[test]
fn hello_survives_detach_and_reattach() {
    if ci() {
        return;
    }

    let mut first = LoopbackPane::new(0, 20, 4);
    first.slave.write_all(b"hello").unwrap();
    assert!(
        first.pump_until(|p| row_text(&p.grid, 0) == "hello", Duration::from_secs(2)),
        "pane never showed the shell output"
    );
    let cursor = (first.pane.cx, first.pane.cy);
    let snapshot = first.pane.snapshot();

    // A second front-end restores the snapshot into a fresh pane and sees
    // the same screen before any further input.
    let mut second = LoopbackPane::new(0, 20, 4);
    second.pane.restore(&snapshot).unwrap();
    assert_eq!(row_text(&second.pane.grid, 0), "hello");
    assert_eq!((second.pane.cx, second.pane.cy), cursor);
    for y in 0..4 {
        assert_eq!(second.pane.grid.row(y), first.pane.grid.row(y), "row {y}");
    }
}

#[test]
fn snapshot_carries_scrollback() {
    if ci() {
        return;
    }

    let mut first = LoopbackPane::new(0, 10, 2);
    first.slave.write_all(b"one\ntwo\nthree\nfour").unwrap();
    assert!(
        first.pump_until(|p| p.grid.stored() >= 2, Duration::from_secs(2)),
        "rows never scrolled into history"
    );

    let snapshot = first.pane.snapshot();
    let mut second = LoopbackPane::new(0, 10, 2);
    second.pane.restore(&snapshot).unwrap();

    assert_eq!(second.pane.grid.stored(), first.pane.grid.stored());
    for k in 0..second.pane.grid.stored() {
        assert_eq!(
            second.pane.grid.history_row(k).cells[0].ch,
            first.pane.grid.history_row(k).cells[0].ch,
            "history row {k}"
        );
    }
}

#[test]
fn split_sizes_reach_the_ptys() {
    if ci() {
        return;
    }

    // An 80-column terminal split in two: 40 and 39 columns, both one row
    // short of the screen for the status bar.
    let geometry = layout(24, 80, 2);
    let mut left = LoopbackPane::new(0, 80, 23);
    let mut right = LoopbackPane::new(1, 80, 23);

    let (sx, sy, xoff, yoff) = geometry[0];
    left.pane.resize(sx, sy, xoff, yoff).unwrap();
    let (sx, sy, xoff, yoff) = geometry[1];
    right.pane.resize(sx, sy, xoff, yoff).unwrap();

    let ws = rustix::termios::tcgetwinsize(&left.slave).unwrap();
    assert_eq!((ws.ws_row, ws.ws_col), (23, 40));
    let ws = rustix::termios::tcgetwinsize(&right.slave).unwrap();
    assert_eq!((ws.ws_row, ws.ws_col), (23, 39));
}

#[test]
fn scroll_stops_at_oldest_row_and_at_live_screen() {
    if ci() {
        return;
    }

    let mut lp = LoopbackPane::new(0, 10, 2);
    lp.slave.write_all(b"a\nb\nc\nd\ne").unwrap();
    assert!(lp.pump_until(|p| p.grid.stored() >= 3, Duration::from_secs(2)));

    let stored = lp.pane.grid.stored();
    lp.pane.scroll_up(stored + 10);
    assert_eq!(lp.pane.grid.scroll_offset(), stored);

    lp.pane.scroll_down(stored + 10);
    assert_eq!(lp.pane.grid.scroll_offset(), 0);
    assert!(!lp.pane.in_history());
}

#[test]
fn narrowing_resize_reflows_history() {
    if ci() {
        return;
    }

    let mut lp = LoopbackPane::new(0, 12, 2);
    lp.slave.write_all(b"abcdefgh\nx\ny\nz").unwrap();
    assert!(lp.pump_until(|p| p.grid.stored() >= 2, Duration::from_secs(2)));

    lp.pane.resize(4, 2, 0, 0).unwrap();

    // Every non-blank character survives in chronological order.
    let mut text = String::new();
    for k in 0..lp.pane.grid.stored() {
        for cell in lp.pane.grid.history_row(k).cells.iter() {
            if cell.ch != ' ' {
                text.push(cell.ch);
            }
        }
    }
    assert!(text.contains("abcdefgh"), "reflowed history was {text:?}");
}

/// A window tiled across an 80×24 terminal, with the slave side of every
/// pane held by the test (dropping a slave is the pane's "shell exit").
fn tiled_window(count: usize) -> (Window, Vec<File>) {
    let geometry = layout(24, 80, count);
    let mut window = Window::new("muxkit");
    let mut slaves = Vec::new();
    for (sx, sy, xoff, yoff) in geometry {
        let pair = terminal::pty::open_pty(sx, sy).unwrap();
        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pair.slave_path)
            .unwrap();
        let id = window.take_pane_id();
        let mut pane = Pane::new(id, sx, sy, xoff, yoff, pair.master);
        pane.resize(sx, sy, xoff, yoff).unwrap();
        window.panes.push(pane);
        slaves.push(slave);
    }
    (window, slaves)
}

/// Observe the hangup the way the event loop does: a ready master whose
/// read returns end-of-stream or a fatal error.
fn master_hung_up(pane: &mut Pane) -> bool {
    let fd = unsafe { BorrowedFd::borrow_raw(pane.master_fd()) };
    let flags = rustix::fs::fcntl_getfl(fd).unwrap();
    rustix::fs::fcntl_setfl(fd, flags | rustix::fs::OFlags::NONBLOCK).unwrap();

    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match pane.read_master(&mut buf) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() > deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return true,
        }
    }
}

#[test]
fn active_pane_exit_removes_it_and_relayouts_survivors() {
    if ci() {
        return;
    }

    let (mut window, mut slaves) = tiled_window(3);
    window.active = 1;

    // The middle pane's "shell" goes away; its master hangs up.
    drop(slaves.remove(1));
    assert!(master_hung_up(&mut window.panes[1]), "master never hung up");

    // What the event loop does with a dead pane: remove it, then re-tile.
    window.remove_pane(1);
    window.apply_layout(24, 80);

    // The next pane in list order is active under the vacated index.
    assert_eq!(window.panes.len(), 2);
    assert_eq!(window.active, 1);
    assert_eq!(window.panes[window.active].id, 2);

    // Survivors re-tile the full width, and their PTYs hear about it.
    let expected = layout(24, 80, 2);
    for (pane, (sx, sy, xoff, _)) in window.panes.iter().zip(expected) {
        assert_eq!((pane.sx, pane.sy, pane.xoff), (sx, sy, xoff));
    }
    let ws = rustix::termios::tcgetwinsize(&slaves[0]).unwrap();
    assert_eq!((ws.ws_row, ws.ws_col), (23, 40));
    let ws = rustix::termios::tcgetwinsize(&slaves[1]).unwrap();
    assert_eq!((ws.ws_row, ws.ws_col), (23, 39));
}

#[test]
fn last_active_pane_exit_falls_back_to_previous() {
    if ci() {
        return;
    }

    let (mut window, mut slaves) = tiled_window(3);
    window.active = 2;

    drop(slaves.remove(2));
    assert!(master_hung_up(&mut window.panes[2]), "master never hung up");

    window.remove_pane(2);
    window.apply_layout(24, 80);

    // The removed pane had no successor, so the previous pane (the new
    // last) becomes active.
    assert_eq!(window.panes.len(), 2);
    assert_eq!(window.active, 1);
    assert_eq!(window.panes[window.active].id, 1);
}

#[test]
fn child_exit_hangs_up_master() {
    if ci() {
        return;
    }

    let mut shell = terminal::pty::spawn_shell(40, 10, std::process::id()).unwrap();
    let mut master = std::fs::File::from(shell.master);
    master.write_all(b"exit\n").unwrap();
    let status = shell.child.wait().unwrap();
    assert!(status.success());

    // With the child gone and the slave closed, the master reports
    // end-of-stream (EOF or EIO depending on the kernel's mood).
    use std::io::Read;
    let mut buf = [0u8; 256];
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        assert!(std::time::Instant::now() < deadline, "master never hung up");
    }
}
