//! Primitive types of the Minecraft wire format.
//!
//! Decoders take any [`Buf`] and advance it past what they consumed, encoders
//! append to any [`BufMut`].

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Longest encoding of a 32-bit `VarInt`.
pub const MAX_VAR_INT_LEN: usize = 5;
/// Longest encoding of a 64-bit `VarLong`.
pub const MAX_VAR_LONG_LEN: usize = 10;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data while reading {0}")]
    UnexpectedEnd(&'static str),
    #[error("VarInt is longer than 5 bytes")]
    VarIntTooLong,
    #[error("VarLong is longer than 10 bytes")]
    VarLongTooLong,
    #[error("string length {0} is negative")]
    NegativeStringLength(i32),
    #[error("string declares {declared} bytes but only {remaining} remain")]
    StringTooShort { declared: usize, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

pub fn read_var_int<B: Buf>(buf: &mut B) -> Result<i32, CodecError> {
    let mut value: u32 = 0;

    for position in 0..MAX_VAR_INT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::UnexpectedEnd("VarInt"));
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & SEGMENT_BITS) << (7 * position);

        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i32);
        }
    }

    Err(CodecError::VarIntTooLong)
}

pub fn read_var_long<B: Buf>(buf: &mut B) -> Result<i64, CodecError> {
    let mut value: u64 = 0;

    for position in 0..MAX_VAR_LONG_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::UnexpectedEnd("VarLong"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & SEGMENT_BITS) << (7 * position);

        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i64);
        }
    }

    Err(CodecError::VarLongTooLong)
}

/// Decodes a `VarInt` at the start of `bytes` without consuming anything.
///
/// Returns `Ok(None)` when `bytes` ends in the middle of the `VarInt`, and the
/// decoded value with its encoded length otherwise.
pub fn peek_var_int(bytes: &[u8]) -> Result<Option<(i32, usize)>, CodecError> {
    let mut cursor = bytes;
    match read_var_int(&mut cursor) {
        Ok(value) => Ok(Some((value, bytes.len() - cursor.len()))),
        Err(CodecError::UnexpectedEnd(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn read_string<B: Buf>(buf: &mut B) -> Result<String, CodecError> {
    let declared = read_var_int(buf)?;
    let Ok(len) = usize::try_from(declared) else {
        return Err(CodecError::NegativeStringLength(declared));
    };

    if buf.remaining() < len {
        return Err(CodecError::StringTooShort {
            declared: len,
            remaining: buf.remaining(),
        });
    }

    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

/// Reads a network-order (big-endian) unsigned short.
pub fn read_unsigned_short<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::UnexpectedEnd("UnsignedShort"));
    }

    let most_significant = buf.get_u8();
    let least_significant = buf.get_u8();
    Ok((u16::from(most_significant) << 8) | u16::from(least_significant))
}

pub fn write_var_int<B: BufMut>(buf: &mut B, value: i32) {
    let mut remaining = value as u32;
    loop {
        if remaining & !u32::from(SEGMENT_BITS) == 0 {
            buf.put_u8(remaining as u8);
            return;
        }
        buf.put_u8((remaining as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        remaining >>= 7;
    }
}

pub fn write_var_long<B: BufMut>(buf: &mut B, value: i64) {
    let mut remaining = value as u64;
    loop {
        if remaining & !u64::from(SEGMENT_BITS) == 0 {
            buf.put_u8(remaining as u8);
            return;
        }
        buf.put_u8((remaining as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        remaining >>= 7;
    }
}

/// Number of bytes `value` occupies once `VarInt`-encoded.
#[must_use]
pub fn var_int_len(value: i32) -> usize {
    let bits = 32 - (value as u32).leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Converts a byte count into the `VarInt` that prefixes it on the wire.
///
/// Callers only encode frames within the frame ceiling, far below `i32::MAX`.
#[must_use]
pub fn length_prefix(len: usize) -> i32 {
    debug_assert!(
        i32::try_from(len).is_ok(),
        "length {len} does not fit in a VarInt"
    );
    len as i32
}

pub fn write_string<B: BufMut>(buf: &mut B, value: &str) {
    write_var_int(buf, length_prefix(value.len()));
    buf.put_slice(value.as_bytes());
}

pub fn write_unsigned_short<B: BufMut>(buf: &mut B, value: u16) {
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}
