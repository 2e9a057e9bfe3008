//! Zigzag-encoded signed varints
//!
//! Every header field is a signed 64-bit integer written as a zigzag varint:
//! the sign is folded into the low bit, then the value is emitted seven bits
//! at a time, least significant group first, high bit set on all but the last
//! byte.

use bytes::{Buf, BufMut};

use crate::ProtoError;

/// Longest possible encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `buf` as a zigzag varint.
pub fn put_varint(buf: &mut impl BufMut, value: i64) {
    let mut ux = (value as u64) << 1;
    if value < 0 {
        ux = !ux;
    }
    put_uvarint(buf, ux);
}

fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Consume one zigzag varint from the front of `buf`.
pub fn read_varint(buf: &mut impl Buf) -> Result<i64, ProtoError> {
    let ux = read_uvarint(buf)?;
    let mut value = (ux >> 1) as i64;
    if ux & 1 != 0 {
        value = !value;
    }
    Ok(value)
}

fn read_uvarint(buf: &mut impl Buf) -> Result<u64, ProtoError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(ProtoError::Truncated);
        }
        let byte = buf.get_u8();
        if byte < 0x80 {
            // The tenth byte may only contribute the final bit.
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(ProtoError::VarintOverflow);
            }
            return Ok(value | (u64::from(byte) << shift));
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }

    Err(ProtoError::VarintOverflow)
}
