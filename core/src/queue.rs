//! Ordered outbound queue of frames and descriptors
//!
//! The queue is the transmitter state machine of a process handle. It knows
//! nothing about event loops: [`WriteQueue::flush`] pushes as much as the
//! transport accepts and reports whether it drained or would block, keeping
//! partial progress for the next call.
//!
//! Items leave strictly in the order they were pushed. A descriptor goes out
//! in one atomic send; a byte buffer may take many writes but stays at the
//! head until its last byte is written.

use crate::{CoreError, Result};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use tracing::trace;

/// One pending outbound item
#[derive(Debug)]
pub enum QueueItem {
    /// An open descriptor waiting to be transferred; closed on drop
    Descriptor(OwnedFd),
    /// Encoded frame bytes, of which the first `written` have been sent
    Bytes {
        /// Full buffer
        buf: Vec<u8>,
        /// Bytes already written
        written: usize,
    },
}

/// Outcome of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The queue is empty
    Drained,
    /// The transport would block; call again when writable
    Blocked,
}

/// Byte and descriptor sink the queue is flushed into
pub trait Transport {
    /// Write some prefix of `buf`, returning how many bytes were taken
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Transfer one descriptor atomically
    fn send_descriptor(&mut self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

impl Transport for UnixStream {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn send_descriptor(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        ipc::fdpass::send_fd(self.as_fd(), fd)
    }
}

/// FIFO of pending items for one control channel
#[derive(Debug, Default)]
pub struct WriteQueue {
    items: VecDeque<QueueItem>,
}

impl WriteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append encoded bytes; empty buffers are ignored
    pub fn push_bytes(&mut self, buf: Vec<u8>) {
        if !buf.is_empty() {
            self.items.push_back(QueueItem::Bytes { buf, written: 0 });
        }
    }

    /// Append a descriptor; the queue owns it until it is sent
    pub fn push_descriptor(&mut self, fd: OwnedFd) {
        self.items.push_back(QueueItem::Descriptor(fd));
    }

    /// Move every item of `other` to the back of this queue
    pub fn append(&mut self, other: &mut WriteQueue) {
        self.items.append(&mut other.items);
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every pending item, closing queued descriptors
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Send as much as `transport` accepts.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Transport`] if a write fails or accepts zero bytes
    /// - [`CoreError::DescriptorTransfer`] if a descriptor cannot be sent
    ///
    /// The queue is left as it was at the failing item; callers treat any
    /// error as fatal to the channel.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Flush> {
        while let Some(head) = self.items.front_mut() {
            match head {
                QueueItem::Descriptor(fd) => match transport.send_descriptor(fd.as_fd()) {
                    Ok(()) => {
                        trace!("descriptor sent, {} items left", self.items.len() - 1);
                        self.items.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CoreError::DescriptorTransfer(e.to_string())),
                },
                QueueItem::Bytes { buf, written } => match transport.write_bytes(&buf[*written..]) {
                    Ok(0) => {
                        return Err(CoreError::Transport(
                            "channel accepted zero bytes".to_string(),
                        ))
                    }
                    Ok(n) => {
                        *written += n;
                        if *written == buf.len() {
                            self.items.pop_front();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CoreError::Transport(e.to_string())),
                },
            }
        }
        Ok(Flush::Drained)
    }
}
