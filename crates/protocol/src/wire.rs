//! Primitive field codec for packet bodies.
//!
//! Strings are a 7-bit variable-length byte count followed by UTF-8 bytes.
//! Integers are little-endian. Readers advance a `&[u8]` cursor and never
//! read past the end of the body.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("body truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("string length prefix is malformed")]
    BadLength,
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: i64 },
    #[error("{0} unread bytes after packet body")]
    TrailingBytes(usize),
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_7bit_len(buf, value.len());
    buf.put_slice(value.as_bytes());
}

fn put_7bit_len(buf: &mut BytesMut, len: usize) {
    let mut value = len as u32;
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_7bit_len(buf: &mut &[u8]) -> Result<usize, WireError> {
    let mut result: u32 = 0;
    // At most five bytes encode a u32.
    for shift in (0..35).step_by(7) {
        ensure(buf, 1)?;
        let byte = buf.get_u8();
        if shift == 28 && byte > 0x0F {
            return Err(WireError::BadLength);
        }
        result |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result as usize);
        }
    }
    Err(WireError::BadLength)
}

pub fn get_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = get_7bit_len(buf)?;
    ensure(buf, len)?;
    let current: &[u8] = *buf;
    let (head, tail) = current.split_at(len);
    let text = std::str::from_utf8(head)
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    *buf = tail;
    Ok(text)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool(buf: &mut &[u8]) -> Result<bool, WireError> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidValue {
            field: "bool",
            value: i64::from(other),
        }),
    }
}

pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn put_i32(buf: &mut BytesMut, value: i32) {
    buf.put_i32_le(value);
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn put_i64(buf: &mut BytesMut, value: i64) {
    buf.put_i64_le(value);
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) {
    put_bool(buf, value.is_some());
    if let Some(value) = value {
        put_string(buf, value);
    }
}

pub fn get_opt_string(buf: &mut &[u8]) -> Result<Option<String>, WireError> {
    if get_bool(buf)? {
        get_string(buf).map(Some)
    } else {
        Ok(None)
    }
}

/// `i32` entry count, then key/value string pairs in key order.
pub fn put_string_map(buf: &mut BytesMut, map: &BTreeMap<String, String>) {
    put_i32(buf, map.len() as i32);
    for (key, value) in map {
        put_string(buf, key);
        put_string(buf, value);
    }
}

pub fn get_string_map(buf: &mut &[u8]) -> Result<BTreeMap<String, String>, WireError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Err(WireError::InvalidValue {
            field: "map entry count",
            value: i64::from(count),
        });
    }
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        map.insert(key, value);
    }
    Ok(map)
}

pub fn expect_end(buf: &[u8]) -> Result<(), WireError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes(buf.len()))
    }
}
