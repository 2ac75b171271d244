//! Client/server wire protocol
//!
//! Every message is a fixed `{kind, len}` header followed by `len` payload
//! bytes. Both header fields are native-endian u32; the transport is a
//! per-user Unix socket, so cross-endian framing is a non-goal. File
//! descriptors travel out of band as SCM_RIGHTS ancillary data (see `fd`).
//!
//! One deliberate wart is preserved from the original protocol: the reply to
//! `Version` is a bare native-endian u32 with no frame header. Changing it
//! would be a protocol version bump.

pub mod fd;

use std::io::{self, Read, Write};
use std::path::PathBuf;

use thiserror::Error;

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a sane payload. A header announcing more than this is
/// treated as a protocol violation, not an allocation request.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Size of the frame header on the wire (two u32 words).
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("payload length {0} exceeds limit")]
    Oversize(u32),

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Message kinds carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Handshake; payload is the client's protocol version.
    Version = 0,
    /// NUL-terminated ASCII command: `new-session` or `pane-split`.
    Command = 1,
    /// Window size report; payload is four u16s.
    Resize = 2,
    /// Empty payload: detach request. Four-byte payload: attach to that id.
    Detach = 3,
    /// Session listing request; reply is raw length + text.
    ListSessions = 4,
    /// Kill the session named in the payload; reply is raw length + text.
    DetachKill = 5,
    /// Client announces it is leaving; payload is its ASCII pid.
    Exited = 6,
    /// Pane id followed by a serialized grid snapshot.
    GridSave = 7,
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => MessageKind::Version,
            1 => MessageKind::Command,
            2 => MessageKind::Resize,
            3 => MessageKind::Detach,
            4 => MessageKind::ListSessions,
            5 => MessageKind::DetachKill,
            6 => MessageKind::Exited,
            7 => MessageKind::GridSave,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// One decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Read bytes until `buf` is full, retrying on interruption.
///
/// Returns false when the peer closed the connection before the first byte
/// (a clean EOF); a close anywhere later is `Truncated`.
fn read_full(stream: &mut impl Read, buf: &mut [u8]) -> Result<bool, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(true)
}

/// Write the whole buffer, retrying on interruption.
pub fn write_full(stream: &mut impl Write, buf: &[u8]) -> Result<(), ProtocolError> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(())
}

/// Read one framed message. `Ok(None)` is a clean disconnect at a frame
/// boundary; EOF inside a frame is an error.
pub fn read_message(stream: &mut impl Read) -> Result<Option<Frame>, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    if !read_full(stream, &mut header)? {
        return Ok(None);
    }

    let kind = u32::from_ne_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_ne_bytes(header[4..8].try_into().unwrap());
    let kind = MessageKind::try_from(kind)?;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::Oversize(len));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 && !read_full(stream, &mut payload)? {
        return Err(ProtocolError::Truncated);
    }

    tracing::trace!(?kind, len, "frame received");
    Ok(Some(Frame { kind, payload }))
}

/// Write one framed message.
pub fn write_message(
    stream: &mut impl Write,
    kind: MessageKind,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(kind as u32).to_ne_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(payload);
    write_full(stream, &buf)
}

/// Write a bare native-endian u32 with no frame header (the version reply
/// and the attach-sequence counters use this form).
pub fn write_u32_raw(stream: &mut impl Write, value: u32) -> Result<(), ProtocolError> {
    write_full(stream, &value.to_ne_bytes())
}

/// Read a bare native-endian u32.
pub fn read_u32_raw(stream: &mut impl Read) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    if !read_full(stream, &mut buf)? {
        return Err(ProtocolError::Truncated);
    }
    Ok(u32::from_ne_bytes(buf))
}

/// Write a raw native-endian u64 byte count (the text-reply length prefix).
pub fn write_u64_raw(stream: &mut impl Write, value: u64) -> Result<(), ProtocolError> {
    write_full(stream, &value.to_ne_bytes())
}

/// Read a raw native-endian u64.
pub fn read_u64_raw(stream: &mut impl Read) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    if !read_full(stream, &mut buf)? {
        return Err(ProtocolError::Truncated);
    }
    Ok(u64::from_ne_bytes(buf))
}

/// Reported terminal geometry, mirroring the kernel winsize struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

impl WindowSize {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&self.rows.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.cols.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.xpixel.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.ypixel.to_ne_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 8 {
            return Err(ProtocolError::Malformed("winsize payload must be 8 bytes"));
        }
        Ok(Self {
            rows: u16::from_ne_bytes(payload[0..2].try_into().unwrap()),
            cols: u16::from_ne_bytes(payload[2..4].try_into().unwrap()),
            xpixel: u16::from_ne_bytes(payload[4..6].try_into().unwrap()),
            ypixel: u16::from_ne_bytes(payload[6..8].try_into().unwrap()),
        })
    }
}

/// Encode a `Command` payload (NUL-terminated ASCII).
pub fn encode_command(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf
}

/// Decode a `Command` payload.
pub fn decode_command(payload: &[u8]) -> Result<&str, ProtocolError> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Malformed("command is not NUL-terminated"))?;
    std::str::from_utf8(&payload[..end])
        .map_err(|_| ProtocolError::Malformed("command is not ASCII"))
}

/// Split a `GridSave` payload into the pane id and the snapshot bytes.
pub fn split_grid_save(payload: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Malformed("grid save payload too short"));
    }
    let pane_id = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
    Ok((pane_id, &payload[4..]))
}

/// Build a `GridSave` payload from a pane id and snapshot bytes.
pub fn encode_grid_save(pane_id: u32, snapshot: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + snapshot.len());
    buf.extend_from_slice(&pane_id.to_ne_bytes());
    buf.extend_from_slice(snapshot);
    buf
}

/// Per-user runtime directory: `${TMPDIR:-/tmp}/muxkit-<uid>`.
///
/// When `MUXKIT_SOCKET` is set (the test harness does this), the directory
/// containing that socket is used instead.
pub fn runtime_dir() -> PathBuf {
    if let Ok(path) = std::env::var("MUXKIT_SOCKET") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            return parent.to_path_buf();
        }
    }
    let tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    let uid = rustix::process::getuid().as_raw();
    PathBuf::from(tmp).join(format!("muxkit-{uid}"))
}

/// Path of the listening socket.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("MUXKIT_SOCKET") {
        return PathBuf::from(path);
    }
    runtime_dir().join("default")
}

/// Path of the advisory lock file taken while forking the server.
pub fn lock_path() -> PathBuf {
    let mut path = socket_path().into_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

/// Path of the optional keybinding file.
pub fn keybinds_path() -> PathBuf {
    runtime_dir().join("keybinds.conf")
}

/// Create the runtime directory with owner-only permissions.
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    use std::os::unix::fs::DirBuilderExt;

    let dir = runtime_dir();
    match std::fs::DirBuilder::new().mode(0o700).create(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn frame_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        write_message(&mut a, MessageKind::Command, &encode_command("pane-split")).unwrap();
        let frame = read_message(&mut b).unwrap().unwrap();
        assert_eq!(frame.kind, MessageKind::Command);
        assert_eq!(decode_command(&frame.payload).unwrap(), "pane-split");
    }

    #[test]
    fn empty_payload_frame() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        write_message(&mut a, MessageKind::Detach, &[]).unwrap();
        let frame = read_message(&mut b).unwrap().unwrap();
        assert_eq!(frame.kind, MessageKind::Detach);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn eof_at_boundary_is_clean() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(read_message(&mut b).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_error() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        // A header announcing 100 bytes, then hang up.
        let mut header = Vec::new();
        header.extend_from_slice(&(MessageKind::GridSave as u32).to_ne_bytes());
        header.extend_from_slice(&100u32.to_ne_bytes());
        write_full(&mut a, &header).unwrap();
        drop(a);

        match read_message(&mut b) {
            Err(ProtocolError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(&99u32.to_ne_bytes());
        header.extend_from_slice(&0u32.to_ne_bytes());
        write_full(&mut a, &header).unwrap();

        match read_message(&mut b) {
            Err(ProtocolError::UnknownKind(99)) => {}
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn oversize_length_rejected() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(&(MessageKind::GridSave as u32).to_ne_bytes());
        header.extend_from_slice(&(MAX_PAYLOAD + 1).to_ne_bytes());
        write_full(&mut a, &header).unwrap();

        match read_message(&mut b) {
            Err(ProtocolError::Oversize(_)) => {}
            other => panic!("expected Oversize, got {other:?}"),
        }
    }

    #[test]
    fn raw_u32_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_u32_raw(&mut a, PROTOCOL_VERSION).unwrap();
        assert_eq!(read_u32_raw(&mut b).unwrap(), PROTOCOL_VERSION);
    }

    #[test]
    fn winsize_roundtrip() {
        let ws = WindowSize { rows: 42, cols: 100, xpixel: 0, ypixel: 0 };
        assert_eq!(WindowSize::decode(&ws.encode()).unwrap(), ws);
    }

    #[test]
    fn winsize_rejects_short_payload() {
        assert!(WindowSize::decode(&[0u8; 7]).is_err());
    }

    #[test]
    fn grid_save_split() {
        let payload = encode_grid_save(3, b"snapshot");
        let (pane_id, rest) = split_grid_save(&payload).unwrap();
        assert_eq!(pane_id, 3);
        assert_eq!(rest, b"snapshot");
    }
}
