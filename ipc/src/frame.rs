//! Framed command protocol
//!
//! Every command on the control channel is one frame:
//!
//! ```text
//! [1-byte tag][4-byte big-endian payload length][payload]
//! ```
//!
//! `args`, `eval` and `run` payloads are consecutive sub-strings, each
//! prefixed by a [varint](crate::varint) length. `handle` and `fork` carry no
//! payload; a `handle` header is followed on the wire by one out-of-band
//! descriptor marker (see [`crate::fdpass`]).
//!
//! [`FrameReader`] never reads past the end of the current frame, so the
//! descriptor that follows a `handle` header is still in the socket when the
//! header has been decoded.

use crate::varint::{decode_varint, encode_varint};
use crate::{IpcError, Result};
use std::io::{ErrorKind, Read};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 5;

/// Largest payload a peer may declare (16 MiB)
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Command kind carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A descriptor follows out-of-band
    Handle,
    /// Argument strings for the accumulator
    Args,
    /// Call a registered command
    Eval,
    /// Fork the serving process
    Fork,
    /// Hand control to an entry point
    Run,
}

impl Tag {
    /// Wire byte for this tag
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Handle => b'h',
            Self::Args => b'a',
            Self::Eval => b'e',
            Self::Fork => b'f',
            Self::Run => b'r',
        }
    }

    /// Parse a wire byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'h' => Ok(Self::Handle),
            b'a' => Ok(Self::Args),
            b'e' => Ok(Self::Eval),
            b'f' => Ok(Self::Fork),
            b'r' => Ok(Self::Run),
            other => Err(IpcError::ProtocolCorruption(format!(
                "unknown frame tag 0x{other:02x}"
            ))),
        }
    }
}

/// A decoded command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Receive one descriptor next
    Handle,
    /// Append strings to the accumulator
    Args(Vec<Vec<u8>>),
    /// Call the named command with `args`
    Eval {
        /// Registered command name
        command: String,
        /// Arguments for this call only
        args: Vec<Vec<u8>>,
    },
    /// Fork; the last accumulated descriptor becomes the child's channel
    Fork,
    /// Hand off to the named entry point
    Run {
        /// Registered entry point name
        entry: String,
    },
}

impl Frame {
    /// Tag for this frame
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Handle => Tag::Handle,
            Frame::Args(_) => Tag::Args,
            Frame::Eval { .. } => Tag::Eval,
            Frame::Fork => Tag::Fork,
            Frame::Run { .. } => Tag::Run,
        }
    }

    /// Build an `args` frame
    pub fn args<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Frame::Args(strings.into_iter().map(|s| s.as_ref().to_vec()).collect())
    }

    /// Build an `eval` frame
    pub fn eval<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Frame::Eval {
            command: command.into(),
            args: args.into_iter().map(|s| s.as_ref().to_vec()).collect(),
        }
    }

    /// Build a `run` frame
    pub fn run(entry: impl Into<String>) -> Self {
        Frame::Run {
            entry: entry.into(),
        }
    }

    /// Encode header and payload
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::FrameTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Frame::Handle | Frame::Fork => Vec::new(),
            Frame::Args(strings) => pack_strings(strings),
            Frame::Eval { command, args } => {
                let mut payload = pack_strings([command.as_bytes()]);
                payload.extend(pack_strings(args));
                payload
            }
            Frame::Run { entry } => pack_strings([entry.as_bytes()]),
        };
        encode_raw(self.tag(), &payload)
    }

    /// Decode a payload received under `tag`
    pub fn decode(tag: Tag, payload: &[u8]) -> Result<Self> {
        match tag {
            Tag::Handle | Tag::Fork => {
                if !payload.is_empty() {
                    return Err(IpcError::ProtocolCorruption(format!(
                        "{tag:?} frame carries {} unexpected payload bytes",
                        payload.len()
                    )));
                }
                Ok(if tag == Tag::Handle {
                    Frame::Handle
                } else {
                    Frame::Fork
                })
            }
            Tag::Args => Ok(Frame::Args(unpack_strings(payload)?)),
            Tag::Eval => {
                let mut strings = unpack_strings(payload)?.into_iter();
                let command = strings.next().ok_or_else(|| {
                    IpcError::ProtocolCorruption("eval frame without a command".to_string())
                })?;
                Ok(Frame::Eval {
                    command: utf8(command, "eval command")?,
                    args: strings.collect(),
                })
            }
            Tag::Run => {
                let mut strings = unpack_strings(payload)?;
                if strings.len() != 1 {
                    return Err(IpcError::ProtocolCorruption(format!(
                        "run frame carries {} strings, expected 1",
                        strings.len()
                    )));
                }
                let entry = strings.remove(0);
                Ok(Frame::Run {
                    entry: utf8(entry, "run entry point")?,
                })
            }
        }
    }
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| IpcError::ProtocolCorruption(format!("{what} is not valid UTF-8")))
}

/// Prefix `payload` with the header for `tag`
pub fn encode_raw(tag: Tag, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(IpcError::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag.as_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Concatenate varint-prefixed strings
pub fn pack_strings<I, S>(strings: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for s in strings {
        let s = s.as_ref();
        encode_varint(s.len() as u64, &mut out);
        out.extend_from_slice(s);
    }
    out
}

/// Split a payload produced by [`pack_strings`]
pub fn unpack_strings(mut payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut strings = Vec::new();
    while !payload.is_empty() {
        let (len, used) = decode_varint(payload)?;
        payload = &payload[used..];
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= payload.len())
            .ok_or_else(|| {
                IpcError::ProtocolCorruption(format!(
                    "sub-string of {len} bytes overruns payload ({} bytes left)",
                    payload.len()
                ))
            })?;
        strings.push(payload[..len].to_vec());
        payload = &payload[len..];
    }
    Ok(strings)
}

/// Incremental frame decoder.
///
/// Keeps partial header and payload progress across `WouldBlock`, so it can
/// be driven from a non-blocking socket as well as a blocking one.
#[derive(Debug, Default)]
pub struct FrameReader {
    header: [u8; HEADER_LEN],
    header_filled: usize,
    pending: Option<PendingPayload>,
}

#[derive(Debug)]
struct PendingPayload {
    tag: Tag,
    buf: Vec<u8>,
    filled: usize,
}

enum Fill {
    Complete,
    Blocked,
}

impl FrameReader {
    /// Create a reader positioned at a frame boundary
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the reader sits between frames
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0 && self.pending.is_none()
    }

    /// Read towards the next frame.
    ///
    /// Returns `Ok(None)` if `src` would block before the frame is complete.
    /// Progress is kept; call again when readable.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] on EOF, [`IpcError::ReceiveFailed`] on
    /// I/O failure, and [`IpcError::ProtocolCorruption`] or
    /// [`IpcError::FrameTooLarge`] for a malformed frame.
    pub fn poll_frame<R: Read>(&mut self, src: &mut R) -> Result<Option<Frame>> {
        loop {
            if let Some(mut pending) = self.pending.take() {
                return match fill(src, &mut pending.buf, &mut pending.filled)? {
                    Fill::Complete => Frame::decode(pending.tag, &pending.buf).map(Some),
                    Fill::Blocked => {
                        self.pending = Some(pending);
                        Ok(None)
                    }
                };
            }

            if let Fill::Blocked = fill(src, &mut self.header, &mut self.header_filled)? {
                return Ok(None);
            }
            self.header_filled = 0;

            let tag = Tag::from_byte(self.header[0])?;
            let len = u32::from_be_bytes([
                self.header[1],
                self.header[2],
                self.header[3],
                self.header[4],
            ]) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(IpcError::FrameTooLarge {
                    len,
                    max: MAX_PAYLOAD_LEN,
                });
            }
            self.pending = Some(PendingPayload {
                tag,
                buf: vec![0; len],
                filled: 0,
            });
        }
    }

    /// Read one whole frame from a blocking source
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<Frame> {
        match self.poll_frame(src)? {
            Some(frame) => Ok(frame),
            None => Err(IpcError::ReceiveFailed(
                "source would block during a blocking read".to_string(),
            )),
        }
    }
}

fn fill<R: Read>(src: &mut R, buf: &mut [u8], filled: &mut usize) -> Result<Fill> {
    while *filled < buf.len() {
        match src.read(&mut buf[*filled..]) {
            Ok(0) => return Err(IpcError::ConnectionClosed),
            Ok(n) => *filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::Blocked),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(IpcError::ReceiveFailed(e.to_string())),
        }
    }
    Ok(Fill::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Hands out at most `chunk` bytes per read and reports `WouldBlock`
    /// between chunks.
    struct Trickle {
        data: VecDeque<u8>,
        chunk: usize,
        block_next: bool,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data: data.into(),
                chunk,
                block_next: false,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = buf.len().min(self.chunk).min(self.data.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = Frame::args(["xy"]).encode().unwrap();
        assert_eq!(bytes, vec![b'a', 0, 0, 0, 3, 2, b'x', b'y']);

        let bytes = Frame::Handle.encode().unwrap();
        assert_eq!(bytes, vec![b'h', 0, 0, 0, 0]);
    }

    #[test]
    fn test_eval_payload_puts_command_first() {
        let frame = Frame::eval("set", ["k", "v"]);
        let bytes = frame.encode().unwrap();
        let strings = unpack_strings(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(strings, vec![b"set".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(Frame::decode(Tag::Eval, &bytes[HEADER_LEN..]).unwrap(), frame);
    }

    #[test]
    fn test_unknown_tag_is_rejected_before_payload() {
        let mut wire = vec![b'z', 0, 0, 0, 2, 1, b'q'];
        wire.extend(Frame::args(["after"]).encode().unwrap());
        let mut src = io::Cursor::new(wire);
        let mut reader = FrameReader::new();
        let err = reader.poll_frame(&mut src).unwrap_err();
        assert!(matches!(err, IpcError::ProtocolCorruption(_)));
        // Only the header was consumed
        assert_eq!(src.position(), HEADER_LEN as u64);
    }

    #[test]
    fn test_reader_resumes_across_would_block() {
        let frames = vec![
            Frame::args(["alpha", "beta"]),
            Frame::eval("require", ["demo"]),
            Frame::Fork,
            Frame::run("echo_args"),
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend(frame.encode().unwrap());
        }

        let mut src = Trickle::new(wire, 1);
        let mut reader = FrameReader::new();
        let mut decoded = Vec::new();
        let mut attempts = 0;
        while decoded.len() < frames.len() {
            attempts += 1;
            assert!(attempts < 10_000, "reader made no progress");
            if let Some(frame) = reader.poll_frame(&mut src).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
        assert!(reader.is_idle());
    }

    #[test]
    fn test_reader_never_reads_past_frame() {
        let mut wire = Frame::Handle.encode().unwrap();
        wire.push(0xAA); // stand-in for the descriptor marker
        let mut src = io::Cursor::new(wire);
        let mut reader = FrameReader::new();
        assert_eq!(reader.read_frame(&mut src).unwrap(), Frame::Handle);
        assert_eq!(src.position(), HEADER_LEN as u64);
    }

    #[test]
    fn test_eof_is_connection_closed() {
        let mut src = io::Cursor::new(vec![b'a', 0, 0]);
        let err = FrameReader::new().read_frame(&mut src).unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut src = io::Cursor::new(vec![b'a', 0xff, 0xff, 0xff, 0xff]);
        let err = FrameReader::new().read_frame(&mut src).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_malformed_payloads() {
        // sub-string claims more bytes than present
        assert!(Frame::decode(Tag::Args, &[5, b'a']).is_err());
        // fork must be empty
        assert!(Frame::decode(Tag::Fork, &[0]).is_err());
        // run needs exactly one string
        assert!(Frame::decode(Tag::Run, &pack_strings(["a", "b"])).is_err());
        assert!(Frame::decode(Tag::Run, &[]).is_err());
        // eval needs a command
        assert!(Frame::decode(Tag::Eval, &[]).is_err());
    }

    #[test]
    fn test_empty_args_frame_is_valid() {
        let frame = Frame::args(Vec::<&str>::new());
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![b'a', 0, 0, 0, 0]);
        assert_eq!(Frame::decode(Tag::Args, &[]).unwrap(), Frame::Args(vec![]));
    }
}
