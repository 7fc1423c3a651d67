//! Byte-level reader/writer used by the message codecs.

use std::fmt;

use crate::{MsgType, HEADER_SIZE, PROTOCOL_VERSION};

/// Decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the fields require.
    Truncated,
    /// Header length does not match the buffer length.
    LengthMismatch { header: usize, actual: usize },
    /// Unknown protocol version.
    BadVersion(u8),
    /// Unknown message discriminant.
    BadType(u8),
    /// Unknown sub-operation discriminant.
    BadOp(u8),
    /// Field expected to be UTF-8 was not.
    BadUtf8,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "message truncated"),
            WireError::LengthMismatch { header, actual } => {
                write!(f, "header length {} != buffer length {}", header, actual)
            }
            WireError::BadVersion(v) => write!(f, "unknown protocol version {}", v),
            WireError::BadType(t) => write!(f, "unknown message type {}", t),
            WireError::BadOp(o) => write!(f, "unknown operation {}", o),
            WireError::BadUtf8 => write!(f, "invalid utf-8 in string field"),
        }
    }
}

impl std::error::Error for WireError {}

/// Message writer. Reserves the fixed header, then finalizes the length.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(msg_type: MsgType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0, msg_type.to_u8(), PROTOCOL_VERSION, 0, 0]);
        Writer { buf }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed short field (keys, names, expressions).
    pub fn put_bytes16(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.put_u16(v.len() as u16);
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed long field (values, request bodies).
    pub fn put_bytes32(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u32::MAX as usize);
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

/// Message reader positioned after the fixed header.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Validate the header against `expected` and position past it.
    pub fn new(buf: &'a [u8], expected: MsgType) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len != buf.len() {
            return Err(WireError::LengthMismatch {
                header: len,
                actual: buf.len(),
            });
        }
        if buf[5] != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(buf[5]));
        }
        if buf[4] != expected.to_u8() {
            return Err(WireError::BadType(buf[4]));
        }
        Ok(Reader {
            buf,
            pos: HEADER_SIZE,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        let s = self.take(4)?;
        Ok(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let s = self.take(8)?;
        Ok(u64::from_le_bytes([
            s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
        ]))
    }

    pub fn get_bytes16(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.get_u16()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_bytes32(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.get_u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_string16(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.get_bytes16()?).map_err(|_| WireError::BadUtf8)
    }
}
