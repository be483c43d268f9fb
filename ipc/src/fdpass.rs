//! Descriptor transfer over a connected Unix stream socket
//!
//! One descriptor travels as one marker byte with an `SCM_RIGHTS` control
//! message attached. The kernel never merges that byte with neighbouring
//! plain data when a reader asks for exactly one byte, so a reader that has
//! consumed precisely up to the marker receives the descriptor with it.

// Adopting received descriptors requires `OwnedFd::from_raw_fd`
#![allow(unsafe_code)]

use crate::{IpcError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// Data byte that carries the control message
pub const MARKER: u8 = 0;

/// A dead peer must fail the send with `EPIPE`, never raise `SIGPIPE`
#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Send `fd` across `socket`.
///
/// The receiver gets an independent descriptor for the same open file; the
/// caller keeps (and may close) its own.
///
/// # Errors
///
/// On a non-blocking socket an [`io::ErrorKind::WouldBlock`] error means
/// nothing was sent and the call should be repeated once writable.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&[MARKER])];
    loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsgs, send_flags(), None) {
            Ok(1) => {
                debug!("sent fd {} over socket {}", fds[0], socket.as_raw_fd());
                return Ok(());
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "descriptor marker was not sent",
                ))
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

/// Receive exactly one descriptor from `socket`.
///
/// The returned descriptor is close-on-exec.
///
/// # Errors
///
/// - [`IpcError::ConnectionClosed`] if the peer closed the socket
/// - [`IpcError::DescriptorTransfer`] if the marker arrived without exactly
///   one descriptor, or the control data was truncated
/// - [`IpcError::ReceiveFailed`] for other socket errors
pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut marker = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, raw_fds, truncated) = loop {
        let mut iov = [IoSliceMut::new(&mut marker)];
        match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let mut raw_fds = Vec::new();
                let cmsgs = msg
                    .cmsgs()
                    .map_err(|e| IpcError::DescriptorTransfer(e.to_string()))?;
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        raw_fds.extend(fds);
                    }
                }
                break (
                    msg.bytes,
                    raw_fds,
                    msg.flags.contains(MsgFlags::MSG_CTRUNC),
                );
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(IpcError::ReceiveFailed(errno.to_string())),
        }
    };

    // Take ownership first so that every descriptor is closed on error paths
    let mut received: Vec<OwnedFd> = raw_fds
        .into_iter()
        // SAFETY: SCM_RIGHTS installed these descriptors in our table and
        // nothing else refers to them yet.
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if bytes == 0 && received.is_empty() {
        return Err(IpcError::ConnectionClosed);
    }
    if truncated {
        return Err(IpcError::DescriptorTransfer(
            "control data truncated".to_string(),
        ));
    }
    if received.len() != 1 {
        return Err(IpcError::DescriptorTransfer(format!(
            "expected 1 descriptor with marker, got {}",
            received.len()
        )));
    }

    let fd = received.remove(0);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| IpcError::DescriptorTransfer(format!("set close-on-exec: {e}")))?;
    debug!("received fd {} over socket {}", fd.as_raw_fd(), socket.as_raw_fd());
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_descriptor_refers_to_same_file() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared contents").unwrap();

        send_fd(tx.as_fd(), file.as_fd()).unwrap();
        drop(file);

        let fd = recv_fd(rx.as_fd()).unwrap();
        let mut received = std::fs::File::from(fd);
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        received.read_to_string(&mut out).unwrap();
        assert_eq!(out, "shared contents");
    }

    #[test]
    fn test_received_descriptor_is_cloexec() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fd(tx.as_fd(), file.as_fd()).unwrap();

        let fd = recv_fd(rx.as_fd()).unwrap();
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_plain_byte_is_not_a_descriptor() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&[MARKER]).unwrap();
        let err = recv_fd(rx.as_fd()).unwrap_err();
        assert!(matches!(err, IpcError::DescriptorTransfer(_)));
    }

    #[test]
    fn test_closed_peer() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let err = recv_fd(rx.as_fd()).unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[test]
    fn test_send_to_closed_peer_is_broken_pipe() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(rx);
        let file = tempfile::tempfile().unwrap();
        let err = send_fd(tx.as_fd(), file.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_send_suppresses_sigpipe() {
        assert!(send_flags().contains(MsgFlags::MSG_NOSIGNAL));
    }

    #[test]
    fn test_bytes_and_descriptors_keep_order() {
        let (mut tx, mut rx) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        tx.write_all(b"ab").unwrap();
        send_fd(tx.as_fd(), file.as_fd()).unwrap();
        tx.write_all(b"cd").unwrap();

        let mut before = [0u8; 2];
        rx.read_exact(&mut before).unwrap();
        assert_eq!(&before, b"ab");
        let _fd = recv_fd(rx.as_fd()).unwrap();
        let mut after = [0u8; 2];
        rx.read_exact(&mut after).unwrap();
        assert_eq!(&after, b"cd");
    }

    #[test]
    fn test_would_block_on_full_socket() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        tx.set_nonblocking(true).unwrap();
        let file = tempfile::tempfile().unwrap();

        // Fill the socket buffer until the kernel refuses more
        let chunk = [0u8; 4096];
        loop {
            match (&tx).write(&chunk) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let err = send_fd(tx.as_fd(), file.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
