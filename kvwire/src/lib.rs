//! Client wire protocol.
//!
//! Every message starts with a fixed 8-byte header:
//!
//! ```text
//! offset 0: len      u32 LE   total message length including header
//! offset 4: type_id  u8       message discriminant
//! offset 5: version  u8       PROTOCOL_VERSION
//! offset 6: pad      u16      zero
//! ```
//!
//! followed by type-specific fields and variable payload (keys, values,
//! request bodies). Receivers dispatch on `type_id` and decode the matching
//! struct; there is no self-describing framing beyond the header.

mod codec;
mod messages;

pub use codec::{Reader, WireError, Writer};
pub use messages::{
    AdoRequest, AdoResponse, InfoRequest, InfoResponse, IoRequest, IoResponse, PoolRequest,
    PoolResponse, PutAdoRequest, SgElement, ShardStats, StatsResponse,
};

use kvapi::StoreFlags;

/// Result alias for protocol decode operations.
pub type Result<T> = std::result::Result<T, WireError>;

pub const PROTOCOL_VERSION: u8 = 2;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    PoolRequest,
    PoolResponse,
    IoRequest,
    IoResponse,
    InfoRequest,
    InfoResponse,
    AdoRequest,
    PutAdoRequest,
    AdoResponse,
    Stats,
}

impl MsgType {
    pub fn to_u8(self) -> u8 {
        match self {
            MsgType::PoolRequest => 1,
            MsgType::PoolResponse => 2,
            MsgType::IoRequest => 3,
            MsgType::IoResponse => 4,
            MsgType::InfoRequest => 5,
            MsgType::InfoResponse => 6,
            MsgType::AdoRequest => 7,
            MsgType::PutAdoRequest => 8,
            MsgType::AdoResponse => 9,
            MsgType::Stats => 10,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MsgType::PoolRequest),
            2 => Some(MsgType::PoolResponse),
            3 => Some(MsgType::IoRequest),
            4 => Some(MsgType::IoResponse),
            5 => Some(MsgType::InfoRequest),
            6 => Some(MsgType::InfoResponse),
            7 => Some(MsgType::AdoRequest),
            8 => Some(MsgType::PutAdoRequest),
            9 => Some(MsgType::AdoResponse),
            10 => Some(MsgType::Stats),
            _ => None,
        }
    }
}

/// Split a frame that carries an encoded message followed by raw value
/// bytes (two-buffer responses). Returns `(message, trailing_value)`.
pub fn split_frame(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > buf.len() {
        return Err(WireError::LengthMismatch {
            header: len,
            actual: buf.len(),
        });
    }
    Ok(buf.split_at(len))
}

/// Read the type discriminant of an encoded message without decoding it.
pub fn peek_type(buf: &[u8]) -> Result<MsgType> {
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
    MsgType::from_u8(buf[4]).ok_or(WireError::BadType(buf[4]))
}

/// Pool sub-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Create,
    Open,
    Close,
    Delete,
}

impl PoolOp {
    pub fn to_u8(self) -> u8 {
        match self {
            PoolOp::Create => 1,
            PoolOp::Open => 2,
            PoolOp::Close => 3,
            PoolOp::Delete => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PoolOp::Create),
            2 => Some(PoolOp::Open),
            3 => Some(PoolOp::Close),
            4 => Some(PoolOp::Delete),
            _ => None,
        }
    }
}

/// IO sub-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Put,
    Get,
    Erase,
    PutAdvance,
    PutLocate,
    PutRelease,
    GetLocate,
    GetRelease,
    Locate,
    Release,
    ReleaseWithFlush,
    Configure,
}

impl IoOp {
    pub fn to_u8(self) -> u8 {
        match self {
            IoOp::Put => 1,
            IoOp::Get => 2,
            IoOp::Erase => 3,
            IoOp::PutAdvance => 4,
            IoOp::PutLocate => 5,
            IoOp::PutRelease => 6,
            IoOp::GetLocate => 7,
            IoOp::GetRelease => 8,
            IoOp::Locate => 9,
            IoOp::Release => 10,
            IoOp::ReleaseWithFlush => 11,
            IoOp::Configure => 12,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(IoOp::Put),
            2 => Some(IoOp::Get),
            3 => Some(IoOp::Erase),
            4 => Some(IoOp::PutAdvance),
            5 => Some(IoOp::PutLocate),
            6 => Some(IoOp::PutRelease),
            7 => Some(IoOp::GetLocate),
            8 => Some(IoOp::GetRelease),
            9 => Some(IoOp::Locate),
            10 => Some(IoOp::Release),
            11 => Some(IoOp::ReleaseWithFlush),
            12 => Some(IoOp::Configure),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// IO request flags. The low bits mirror the backend store flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        const CREATE_ONLY = 1 << 0;
        const DONT_STOMP = 1 << 1;
        const READ_ONLY = 1 << 2;
        /// Client wants locate-style transfers only; never inline a value.
        const DIRECT = 1 << 8;
    }
}

impl IoFlags {
    /// Project the backend-relevant bits.
    pub fn store_flags(self) -> StoreFlags {
        StoreFlags::from_bits_truncate(self.bits() & 0x7)
    }
}

bitflags::bitflags! {
    /// ADO invocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdoFlags: u32 {
        /// No client response unless the invocation fails.
        const ASYNC = 1 << 0;
        /// Create the key-value pair without invoking the ADO.
        const CREATE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        /// Deliver the value as a detached pool-memory payload.
        const DETACHED = 1 << 3;
        /// Skip the put when the key already exists.
        const NO_OVERWRITE = 1 << 4;
    }
}

/// Info request discriminants; attribute queries share the space with the
/// two shard-level request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    FindKey,
    GetStats,
    Attr(kvapi::Attribute),
}

impl InfoType {
    pub fn to_u32(self) -> u32 {
        match self {
            InfoType::FindKey => 0x100,
            InfoType::GetStats => 0x101,
            InfoType::Attr(a) => a.to_u32(),
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x100 => Some(InfoType::FindKey),
            0x101 => Some(InfoType::GetStats),
            other => kvapi::Attribute::from_u32(other).map(InfoType::Attr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_round_trip() {
        for t in [
            MsgType::PoolRequest,
            MsgType::PoolResponse,
            MsgType::IoRequest,
            MsgType::IoResponse,
            MsgType::InfoRequest,
            MsgType::InfoResponse,
            MsgType::AdoRequest,
            MsgType::PutAdoRequest,
            MsgType::AdoResponse,
            MsgType::Stats,
        ] {
            assert_eq!(MsgType::from_u8(t.to_u8()), Some(t));
        }
        assert_eq!(MsgType::from_u8(0), None);
    }

    #[test]
    fn test_io_flags_store_projection() {
        let f = IoFlags::DONT_STOMP | IoFlags::DIRECT;
        assert_eq!(f.store_flags(), StoreFlags::DONT_STOMP);
    }
}
