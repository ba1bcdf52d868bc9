//! Cursor-based helpers for the fixed big-endian on-disk and wire layouts.
//!
//! Every persistent format in this crate (WAL frames, SSTable sections,
//! manifest snapshots, replication frames) is a fixed big-endian byte
//! layout. These helpers read primitives from a slice while advancing a
//! caller-owned cursor, so multi-field decoders stay flat and every
//! out-of-bounds read surfaces as [`CodecError::UnexpectedEof`] instead of a
//! panic.

use thiserror::Error;

/// Errors produced while decoding a fixed byte layout.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A key field did not hold valid UTF-8.
    #[error("invalid UTF-8 in key: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length field exceeded what its wire type can carry.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

#[inline]
fn require(buf: &[u8], at: usize, needed: usize) -> Result<(), CodecError> {
    let available = buf.len().saturating_sub(at);
    if available < needed {
        return Err(CodecError::UnexpectedEof { needed, available });
    }
    Ok(())
}

pub fn take_u8(buf: &[u8], at: &mut usize) -> Result<u8, CodecError> {
    require(buf, *at, 1)?;
    let v = buf[*at];
    *at += 1;
    Ok(v)
}

pub fn take_u16(buf: &[u8], at: &mut usize) -> Result<u16, CodecError> {
    require(buf, *at, 2)?;
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[*at..*at + 2]);
    *at += 2;
    Ok(u16::from_be_bytes(raw))
}

pub fn take_u32(buf: &[u8], at: &mut usize) -> Result<u32, CodecError> {
    require(buf, *at, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*at..*at + 4]);
    *at += 4;
    Ok(u32::from_be_bytes(raw))
}

pub fn take_u64(buf: &[u8], at: &mut usize) -> Result<u64, CodecError> {
    require(buf, *at, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*at..*at + 8]);
    *at += 8;
    Ok(u64::from_be_bytes(raw))
}

pub fn take_bytes<'a>(buf: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    require(buf, *at, len)?;
    let slice = &buf[*at..*at + len];
    *at += len;
    Ok(slice)
}

/// Reads a `[key_len:u16][key]` field and validates UTF-8.
pub fn take_key(buf: &[u8], at: &mut usize) -> Result<String, CodecError> {
    let len = take_u16(buf, at)? as usize;
    let raw = take_bytes(buf, at, len)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

/// Reads a `[value_len:u32][value]` field.
pub fn take_value(buf: &[u8], at: &mut usize) -> Result<Vec<u8>, CodecError> {
    let len = take_u32(buf, at)? as usize;
    let raw = take_bytes(buf, at, len)?;
    Ok(raw.to_vec())
}

/// Appends a `[key_len:u16][key]` field.
pub fn put_key(buf: &mut Vec<u8>, key: &str) -> Result<(), CodecError> {
    let len = u16::try_from(key.len())
        .map_err(|_| CodecError::LengthOverflow(format!("key length {} exceeds u16", key.len())))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    Ok(())
}

/// Appends a `[value_len:u32][value]` field.
pub fn put_value(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(value.len()).map_err(|_| {
        CodecError::LengthOverflow(format!("value length {} exceeds u32", value.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}
