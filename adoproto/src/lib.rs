//! ADO proxy contract.
//!
//! An ADO (active data object) is an out-of-process plugin host operating on
//! locked values. The shard talks to it through an [`AdoProxy`]: work
//! requests flow out, completions and callback operations flow back. The
//! side process itself is outside this workspace; [`paired::paired`] builds
//! an in-process queue pair whose plugin half is driven directly by tests
//! and loopback deployments.

pub mod paired;
mod unlock_book;

pub use unlock_book::UnlockBook;

use kvapi::{IterEntry, IterHandle, LockHandle, PoolId, Region, Status, StoreFlags};

/// Identifier of an in-flight work request; allocated by the shard.
pub type WorkId = u64;

/// Description of the pool an ADO is bootstrapped for.
#[derive(Debug, Clone)]
pub struct PoolDesc {
    pub name: String,
    pub size: u64,
    pub flags: StoreFlags,
    pub expected_count: u64,
    pub opened_existing: bool,
}

/// Work request delivered to the plugin.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub work_id: WorkId,
    pub key: Vec<u8>,
    pub value_addr: u64,
    pub value_len: u64,
    pub detached_addr: u64,
    pub detached_len: u64,
    pub request: Vec<u8>,
    pub new_root: bool,
}

/// Where a completion response buffer lives.
#[derive(Debug, Clone)]
pub enum BufferSource {
    /// Bytes carried in the completion itself.
    Inline(Vec<u8>),
    /// Pool-resident bytes; `free` asks the shard to return the memory to
    /// the pool after the response is posted.
    Pool { addr: u64, len: u64, free: bool },
}

#[derive(Debug, Clone)]
pub struct ResponseBuffer {
    pub layer_id: u32,
    pub source: BufferSource,
}

/// One finished work request. `status` is the raw plugin-reported value;
/// the shard clamps it into the accepted window.
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    pub work_id: WorkId,
    pub status: i32,
    pub buffers: Vec<ResponseBuffer>,
}

/// Table operations requested through a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Create,
    Open,
    Erase,
    ValueResize,
    AllocatePoolMemory,
    FreePoolMemory,
}

/// Pool-level operation events sent to (and answered by) the ADO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEvent {
    PoolDelete,
    Close,
}

/// Flags carried by table-op callbacks.
pub mod table_op_flags {
    pub const CREATE_ONLY: u64 = 1 << 0;
    pub const NO_IMPLICIT_UNLOCK: u64 = 1 << 1;
    pub const ADO_LIFETIME_UNLOCK: u64 = 1 << 2;
}

/// Configure-request options.
pub mod configure_options {
    pub const SHARD_INC_REF: u64 = 1 << 0;
    pub const SHARD_DEC_REF: u64 = 1 << 1;
}

/// Callback operations arriving from the plugin while work is in flight.
#[derive(Debug, Clone)]
pub enum AdoCallback {
    TableOp {
        work_id: WorkId,
        op: TableOp,
        key: Vec<u8>,
        value_len: u64,
        align_or_flags: u64,
        addr: u64,
    },
    PoolInfo,
    OpEventResponse(OpEvent),
    Iterate {
        bounds: kvapi::TimeRange,
        iterator: Option<IterHandle>,
    },
    Vector {
        bounds: kvapi::TimeRange,
    },
    IndexFind {
        expr: String,
        begin: u64,
        find_type: u32,
        max_comparisons: u64,
    },
    Unlock {
        work_id: WorkId,
        handle: LockHandle,
    },
    Configure {
        options: u64,
    },
}

/// Vector of key-value references materialized in pool memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceVector {
    pub count: u64,
    pub addr: u64,
    pub len: u64,
}

impl ReferenceVector {
    /// Bytes needed for `count` (key, key_len, value, value_len) records.
    pub fn size_required(count: u64) -> u64 {
        count * 32 + 16
    }
}

/// Replies the shard posts back to the plugin for callback operations.
#[derive(Debug, Clone)]
pub enum AdoReply {
    TableOp {
        status: Status,
        addr: u64,
        len: u64,
        key_handle: Option<LockHandle>,
    },
    PoolInfo {
        status: Status,
        json: String,
    },
    Iterate {
        status: Status,
        iterator: Option<IterHandle>,
        entry: Option<IterEntry>,
    },
    Vector {
        status: Status,
        vector: ReferenceVector,
    },
    FindIndex {
        status: Status,
        position: u64,
        key: Vec<u8>,
    },
    Unlock {
        status: Status,
    },
    Configure {
        status: Status,
    },
}

/// Shard-side handle to one ADO process.
pub trait AdoProxy {
    fn bootstrap_ado(&mut self, opened_existing: bool) -> Result<(), Status>;

    /// Expose one pool region to the plugin; `token` identifies the mapping.
    fn send_memory_map(&mut self, token: u64, len: u64, addr: u64);

    /// Expose a region through a named backing file instead of a raw token.
    fn send_memory_map_named(&mut self, token: u64, file: &str, offset: u64, region: Region);

    fn send_work_request(&mut self, request: WorkRequest);

    fn check_work_completions(&mut self) -> Option<WorkCompletion>;

    fn recv_callback(&mut self) -> Option<AdoCallback>;

    fn send_table_op_response(
        &mut self,
        status: Status,
        addr: u64,
        len: u64,
        key_handle: Option<LockHandle>,
    );

    fn send_pool_info_response(&mut self, status: Status, json: String);

    fn send_iterate_response(
        &mut self,
        status: Status,
        iterator: Option<IterHandle>,
        entry: Option<IterEntry>,
    );

    fn send_vector_response(&mut self, status: Status, vector: ReferenceVector);

    fn send_find_index_response(&mut self, status: Status, position: u64, key: &[u8]);

    fn send_unlock_response(&mut self, status: Status);

    fn send_configure_response(&mut self, status: Status);

    fn send_op_event(&mut self, event: OpEvent);

    fn send_cluster_event(&mut self, sender: &str, kind: &str, content: &str);

    fn shutdown(&mut self);

    // Deferred-unlock bookkeeping, keyed by work id.

    fn add_deferred_unlock(&mut self, work_id: WorkId, handle: LockHandle) -> Result<(), Status>;

    /// Replace the deferred unlock handle for `work_id` (value resize).
    fn update_deferred_unlock(&mut self, work_id: WorkId, handle: LockHandle)
        -> Result<(), Status>;

    fn take_deferred_unlocks(&mut self, work_id: WorkId) -> Vec<LockHandle>;

    fn add_life_unlock(&mut self, handle: LockHandle);

    fn remove_life_unlock(&mut self, handle: LockHandle) -> Result<(), Status>;

    /// Whether `handle` carries an implicit (deferred) unlock for `work_id`.
    fn has_implicit_unlock(&mut self, work_id: WorkId, handle: LockHandle) -> bool;

    /// Drain process-lifetime locks at shutdown; the shard unlocks them.
    fn take_life_unlocks(&mut self) -> Vec<LockHandle>;

    fn pool_id(&self) -> PoolId;

    fn pool_name(&self) -> &str;
}

/// Spawns ADO processes.
pub trait AdoManager {
    fn create(
        &mut self,
        auth_id: u64,
        pool_id: PoolId,
        desc: &PoolDesc,
        plugins: &[String],
        params: &[(String, String)],
        net_addr: &str,
    ) -> Result<Box<dyn AdoProxy>, Status>;
}
