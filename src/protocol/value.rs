//! Scalar values carried in statement parameters and result rows.
//!
//! Values are self-describing: a one-byte tag followed by the payload.
//! Variable-length payloads are 4-byte length prefixed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A statement parameter or row field.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bool(bool),
    Bytes(Bytes),
    Utf8(String),
}

mod tag {
    pub const NULL: u8 = 0x00;
    pub const INT: u8 = 0x01;
    pub const UINT: u8 = 0x02;
    pub const DOUBLE: u8 = 0x03;
    pub const BOOL: u8 = 0x04;
    pub const BYTES: u8 = 0x05;
    pub const UTF8: u8 = 0x06;
}

impl Scalar {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Scalar::Null => buf.put_u8(tag::NULL),
            Scalar::Int(v) => {
                buf.put_u8(tag::INT);
                buf.put_i64(*v);
            }
            Scalar::UInt(v) => {
                buf.put_u8(tag::UINT);
                buf.put_u64(*v);
            }
            Scalar::Double(v) => {
                buf.put_u8(tag::DOUBLE);
                buf.put_f64(*v);
            }
            Scalar::Bool(v) => {
                buf.put_u8(tag::BOOL);
                buf.put_u8(*v as u8);
            }
            Scalar::Bytes(v) => {
                buf.put_u8(tag::BYTES);
                put_blob(buf, v);
            }
            Scalar::Utf8(v) => {
                buf.put_u8(tag::UTF8);
                put_blob(buf, v.as_bytes());
            }
        }
    }

    pub fn parse(buf: &mut Bytes) -> Option<Self> {
        match get_u8(buf)? {
            tag::NULL => Some(Scalar::Null),
            tag::INT => Some(Scalar::Int(get_i64(buf)?)),
            tag::UINT => Some(Scalar::UInt(get_u64(buf)?)),
            tag::DOUBLE => Some(Scalar::Double(get_f64(buf)?)),
            tag::BOOL => Some(Scalar::Bool(get_u8(buf)? != 0)),
            tag::BYTES => Some(Scalar::Bytes(get_blob(buf)?)),
            tag::UTF8 => Some(Scalar::Utf8(get_string(buf)?)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view, parsing textual fields when needed.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Scalar::Int(v) if *v >= 0 => Some(*v as u64),
            Scalar::UInt(v) => Some(*v),
            Scalar::Utf8(s) => s.parse().ok(),
            Scalar::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Utf8(s) => Some(s),
            Scalar::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::UInt(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Utf8(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Utf8(v)
    }
}

// Wire primitives shared by the message set.

pub(crate) fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.extend_from_slice(b);
}

pub(crate) fn put_opt_blob(buf: &mut BytesMut, b: &Option<Bytes>) {
    match b {
        Some(b) => {
            buf.put_u8(1);
            put_blob(buf, b);
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

pub(crate) fn put_opt_str(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Option<u8> {
    (buf.remaining() >= 1).then(|| buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Option<u16> {
    (buf.remaining() >= 2).then(|| buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Option<u32> {
    (buf.remaining() >= 4).then(|| buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Option<u64> {
    (buf.remaining() >= 8).then(|| buf.get_u64())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Option<i64> {
    (buf.remaining() >= 8).then(|| buf.get_i64())
}

pub(crate) fn get_f64(buf: &mut Bytes) -> Option<f64> {
    (buf.remaining() >= 8).then(|| buf.get_f64())
}

pub(crate) fn get_blob(buf: &mut Bytes) -> Option<Bytes> {
    let len = get_u32(buf)? as usize;
    (buf.remaining() >= len).then(|| buf.split_to(len))
}

pub(crate) fn get_opt_blob(buf: &mut Bytes) -> Option<Option<Bytes>> {
    match get_u8(buf)? {
        0 => Some(None),
        _ => Some(Some(get_blob(buf)?)),
    }
}

pub(crate) fn get_string(buf: &mut Bytes) -> Option<String> {
    String::from_utf8(get_blob(buf)?.to_vec()).ok()
}

pub(crate) fn get_opt_string(buf: &mut Bytes) -> Option<Option<String>> {
    match get_u8(buf)? {
        0 => Some(None),
        _ => Some(Some(get_string(buf)?)),
    }
}
