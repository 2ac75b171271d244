//! File-descriptor transfer over the session socket
//!
//! A descriptor rides as one SCM_RIGHTS ancillary message next to a single
//! dummy payload byte, so the transport always delivers data and control
//! together. Both sides keep independent copies afterwards; closing one does
//! not invalidate the other.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};

use crate::ProtocolError;

fn errno_to_io(errno: rustix::io::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno.raw_os_error())
}

/// Send one descriptor with the accompanying dummy byte.
pub fn send_fd(socket: impl AsFd, fd: BorrowedFd<'_>) -> Result<(), ProtocolError> {
    let fds = [fd];
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    control.push(SendAncillaryMessage::ScmRights(&fds));

    loop {
        match sendmsg(
            socket.as_fd(),
            &[IoSlice::new(&[0u8])],
            &mut control,
            SendFlags::empty(),
        ) {
            Ok(_) => return Ok(()),
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(ProtocolError::Io(errno_to_io(e))),
        }
    }
}

/// Receive one descriptor and consume the dummy byte.
pub fn recv_fd(socket: impl AsFd) -> Result<OwnedFd, ProtocolError> {
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let mut byte = [0u8; 1];

    loop {
        match recvmsg(
            socket.as_fd(),
            &mut [IoSliceMut::new(&mut byte)],
            &mut control,
            RecvFlags::empty(),
        ) {
            Ok(ret) => {
                if ret.bytes == 0 {
                    return Err(ProtocolError::Truncated);
                }
                break;
            }
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(ProtocolError::Io(errno_to_io(e))),
        }
    }

    for message in control.drain() {
        if let RecvAncillaryMessage::ScmRights(fds) = message {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(fd);
            }
        }
    }
    Err(ProtocolError::Malformed("no descriptor in ancillary data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn descriptor_crosses_socket() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"via scm_rights").unwrap();
        file.flush().unwrap();

        send_fd(&a, file.as_fd()).unwrap();
        let received = recv_fd(&b).unwrap();

        // The received fd is a distinct descriptor for the same open file.
        assert_ne!(received.as_raw_fd(), file.as_raw_fd());

        let mut copy = std::fs::File::from(received);
        copy.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        copy.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "via scm_rights");
    }

    #[test]
    fn both_copies_stay_valid_after_one_closes() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        send_fd(&a, file.as_fd()).unwrap();
        let received = recv_fd(&b).unwrap();

        drop(received);
        // Sender's copy still works.
        file.write_all(b"still open").unwrap();
    }
}
