//! Base-128 variable-length integers used to prefix sub-strings
//!
//! Groups of seven bits are written most-significant first. Every byte except
//! the last has its high bit set.

use crate::{IpcError, Result};

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `out`
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; MAX_VARINT_LEN];
    let mut start = groups.len();
    loop {
        start -= 1;
        groups[start] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }

    let last = groups.len() - 1;
    for (i, group) in groups.iter().enumerate().skip(start) {
        if i == last {
            out.push(*group);
        } else {
            out.push(group | 0x80);
        }
    }
}

/// Decode one varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN || value > (u64::MAX >> 7) {
            return Err(IpcError::ProtocolCorruption(
                "varint overflows 64 bits".to_string(),
            ));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(IpcError::ProtocolCorruption("truncated varint".to_string()))
}
