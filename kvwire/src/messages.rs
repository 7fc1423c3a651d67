//! Message structs with explicit encode/decode.

use kvapi::Status;

use crate::codec::{Reader, Writer};
use crate::{AdoFlags, InfoType, IoFlags, IoOp, MsgType, PoolOp, Result, WireError};

// === Pool ===

#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub op: PoolOp,
    pub flags: u32,
    pub pool_id: u64,
    pub size: u64,
    pub expected_count: u64,
    pub name: String,
}

impl PoolRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::PoolRequest);
        w.put_u8(self.op.to_u8());
        w.put_u32(self.flags);
        w.put_u64(self.pool_id);
        w.put_u64(self.size);
        w.put_u64(self.expected_count);
        w.put_bytes16(self.name.as_bytes());
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::PoolRequest)?;
        let op_raw = r.get_u8()?;
        let op = PoolOp::from_u8(op_raw).ok_or(WireError::BadOp(op_raw))?;
        Ok(PoolRequest {
            op,
            flags: r.get_u32()?,
            pool_id: r.get_u64()?,
            size: r.get_u64()?,
            expected_count: r.get_u64()?,
            name: r.get_string16()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolResponse {
    pub status: Status,
    pub pool_id: u64,
}

impl PoolResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::PoolResponse);
        w.put_i32(self.status.to_i32());
        w.put_u64(self.pool_id);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::PoolResponse)?;
        Ok(PoolResponse {
            status: Status::from_i32(r.get_i32()?),
            pool_id: r.get_u64()?,
        })
    }
}

// === IO ===

#[derive(Debug, Clone)]
pub struct IoRequest {
    pub op: IoOp,
    pub flags: IoFlags,
    pub pool_id: u64,
    pub request_id: u64,
    /// Value address for `*_RELEASE` ops.
    pub addr: u64,
    /// Pool byte offset for `LOCATE`/`RELEASE*`.
    pub offset: u64,
    /// Transfer size for locate ops, or client receive capacity for `GET`.
    pub size: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl IoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::IoRequest);
        w.put_u8(self.op.to_u8());
        w.put_u32(self.flags.bits());
        w.put_u64(self.pool_id);
        w.put_u64(self.request_id);
        w.put_u64(self.addr);
        w.put_u64(self.offset);
        w.put_u64(self.size);
        w.put_bytes16(&self.key);
        w.put_bytes32(&self.value);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::IoRequest)?;
        let op_raw = r.get_u8()?;
        let op = IoOp::from_u8(op_raw).ok_or(WireError::BadOp(op_raw))?;
        Ok(IoRequest {
            op,
            flags: IoFlags::from_bits_truncate(r.get_u32()?),
            pool_id: r.get_u64()?,
            request_id: r.get_u64()?,
            addr: r.get_u64()?,
            offset: r.get_u64()?,
            size: r.get_u64()?,
            key: r.get_bytes16()?,
            value: r.get_bytes32()?,
        })
    }
}

/// One scatter-gather element of a `Locate` response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgElement {
    pub addr: u64,
    pub len: u64,
}

impl SgElement {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode_list(list: &[SgElement]) -> Vec<u8> {
        let mut out = Vec::with_capacity(list.len() * Self::ENCODED_LEN);
        for e in list {
            out.extend_from_slice(&e.addr.to_le_bytes());
            out.extend_from_slice(&e.len.to_le_bytes());
        }
        out
    }

    pub fn decode_list(data: &[u8]) -> Result<Vec<SgElement>> {
        if data.len() % Self::ENCODED_LEN != 0 {
            return Err(WireError::Truncated);
        }
        Ok(data
            .chunks_exact(Self::ENCODED_LEN)
            .map(|c| SgElement {
                addr: u64::from_le_bytes(c[0..8].try_into().unwrap()),
                len: u64::from_le_bytes(c[8..16].try_into().unwrap()),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct IoResponse {
    pub status: Status,
    pub request_id: u64,
    /// Locked value address for locate-style responses.
    pub addr: u64,
    /// Memory registration key covering the transfer.
    pub key: u64,
    /// Logical data length; may exceed `data.len()` for length-only replies.
    pub data_len: u64,
    pub data: Vec<u8>,
}

impl IoResponse {
    pub fn new(status: Status, request_id: u64) -> Self {
        IoResponse {
            status,
            request_id,
            addr: 0,
            key: 0,
            data_len: 0,
            data: Vec::new(),
        }
    }

    /// Whether the value bytes ride inline in this response.
    pub fn has_inline_data(&self) -> bool {
        self.data_len as usize == self.data.len() && !self.data.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::IoResponse);
        w.put_i32(self.status.to_i32());
        w.put_u64(self.request_id);
        w.put_u64(self.addr);
        w.put_u64(self.key);
        w.put_u64(self.data_len);
        w.put_bytes32(&self.data);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::IoResponse)?;
        Ok(IoResponse {
            status: Status::from_i32(r.get_i32()?),
            request_id: r.get_u64()?,
            addr: r.get_u64()?,
            key: r.get_u64()?,
            data_len: r.get_u64()?,
            data: r.get_bytes32()?,
        })
    }
}

// === INFO ===

#[derive(Debug, Clone)]
pub struct InfoRequest {
    pub info_type: InfoType,
    pub pool_id: u64,
    pub offset: u64,
    /// Key for attribute queries, or the find expression.
    pub key: Vec<u8>,
}

impl InfoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::InfoRequest);
        w.put_u32(self.info_type.to_u32());
        w.put_u64(self.pool_id);
        w.put_u64(self.offset);
        w.put_bytes16(&self.key);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::InfoRequest)?;
        let raw = r.get_u32()?;
        let info_type = InfoType::from_u32(raw).ok_or(WireError::BadOp(raw as u8))?;
        Ok(InfoRequest {
            info_type,
            pool_id: r.get_u64()?,
            offset: r.get_u64()?,
            key: r.get_bytes16()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InfoResponse {
    pub status: Status,
    pub value: u64,
    /// Matched index position for find responses.
    pub offset: u64,
    /// Matched key for find responses.
    pub data: Vec<u8>,
}

impl InfoResponse {
    pub fn new(status: Status) -> Self {
        InfoResponse {
            status,
            value: 0,
            offset: 0,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::InfoResponse);
        w.put_i32(self.status.to_i32());
        w.put_u64(self.value);
        w.put_u64(self.offset);
        w.put_bytes16(&self.data);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::InfoResponse)?;
        Ok(InfoResponse {
            status: Status::from_i32(r.get_i32()?),
            value: r.get_u64()?,
            offset: r.get_u64()?,
            data: r.get_bytes16()?,
        })
    }
}

/// Shard operation counters, returned whole for `GetStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub op_request_count: u64,
    pub op_put_count: u64,
    pub op_get_count: u64,
    pub op_put_direct_count: u64,
    pub op_get_direct_count: u64,
    pub op_get_twostage_count: u64,
    pub op_erase_count: u64,
    pub op_ado_count: u64,
    pub op_failed_request_count: u64,
    pub op_get_direct_offset_count: u64,
    pub failed_async_count: u64,
    pub client_count: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsResponse {
    pub status: Status,
    pub stats: ShardStats,
}

impl StatsResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::Stats);
        w.put_i32(self.status.to_i32());
        let s = &self.stats;
        w.put_u64(s.op_request_count);
        w.put_u64(s.op_put_count);
        w.put_u64(s.op_get_count);
        w.put_u64(s.op_put_direct_count);
        w.put_u64(s.op_get_direct_count);
        w.put_u64(s.op_get_twostage_count);
        w.put_u64(s.op_erase_count);
        w.put_u64(s.op_ado_count);
        w.put_u64(s.op_failed_request_count);
        w.put_u64(s.op_get_direct_offset_count);
        w.put_u64(s.failed_async_count);
        w.put_u16(s.client_count);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::Stats)?;
        Ok(StatsResponse {
            status: Status::from_i32(r.get_i32()?),
            stats: ShardStats {
                op_request_count: r.get_u64()?,
                op_put_count: r.get_u64()?,
                op_get_count: r.get_u64()?,
                op_put_direct_count: r.get_u64()?,
                op_get_direct_count: r.get_u64()?,
                op_get_twostage_count: r.get_u64()?,
                op_erase_count: r.get_u64()?,
                op_ado_count: r.get_u64()?,
                op_failed_request_count: r.get_u64()?,
                op_get_direct_offset_count: r.get_u64()?,
                failed_async_count: r.get_u64()?,
                client_count: r.get_u16()?,
            },
        })
    }
}

// === ADO ===

#[derive(Debug, Clone)]
pub struct AdoRequest {
    pub flags: AdoFlags,
    pub pool_id: u64,
    pub request_id: u64,
    /// Value length to materialize when the key is created on demand.
    pub ondemand_val_len: u64,
    pub key: Vec<u8>,
    pub request: Vec<u8>,
}

impl AdoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::AdoRequest);
        w.put_u32(self.flags.bits());
        w.put_u64(self.pool_id);
        w.put_u64(self.request_id);
        w.put_u64(self.ondemand_val_len);
        w.put_bytes16(&self.key);
        w.put_bytes32(&self.request);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::AdoRequest)?;
        Ok(AdoRequest {
            flags: AdoFlags::from_bits_truncate(r.get_u32()?),
            pool_id: r.get_u64()?,
            request_id: r.get_u64()?,
            ondemand_val_len: r.get_u64()?,
            key: r.get_bytes16()?,
            request: r.get_bytes32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PutAdoRequest {
    pub flags: AdoFlags,
    pub pool_id: u64,
    pub request_id: u64,
    /// Root value length for detached puts.
    pub root_val_len: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub request: Vec<u8>,
}

impl PutAdoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::PutAdoRequest);
        w.put_u32(self.flags.bits());
        w.put_u64(self.pool_id);
        w.put_u64(self.request_id);
        w.put_u64(self.root_val_len);
        w.put_bytes16(&self.key);
        w.put_bytes32(&self.value);
        w.put_bytes32(&self.request);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::PutAdoRequest)?;
        Ok(PutAdoRequest {
            flags: AdoFlags::from_bits_truncate(r.get_u32()?),
            pool_id: r.get_u64()?,
            request_id: r.get_u64()?,
            root_val_len: r.get_u64()?,
            key: r.get_bytes16()?,
            value: r.get_bytes32()?,
            request: r.get_bytes32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdoResponse {
    pub status: Status,
    pub request_id: u64,
    /// `(layer_id, bytes)` per appended response buffer.
    pub buffers: Vec<(u32, Vec<u8>)>,
}

impl AdoResponse {
    pub fn new(status: Status, request_id: u64) -> Self {
        AdoResponse {
            status,
            request_id,
            buffers: Vec::new(),
        }
    }

    pub fn append(&mut self, layer_id: u32, bytes: Vec<u8>) {
        self.buffers.push((layer_id, bytes));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new(MsgType::AdoResponse);
        w.put_i32(self.status.to_i32());
        w.put_u64(self.request_id);
        w.put_u32(self.buffers.len() as u32);
        for (layer_id, bytes) in &self.buffers {
            w.put_u32(*layer_id);
            w.put_bytes32(bytes);
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, MsgType::AdoResponse)?;
        let status = Status::from_i32(r.get_i32()?);
        let request_id = r.get_u64()?;
        let count = r.get_u32()?;
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let layer_id = r.get_u32()?;
            buffers.push((layer_id, r.get_bytes32()?));
        }
        Ok(AdoResponse {
            status,
            request_id,
            buffers,
        })
    }
}
