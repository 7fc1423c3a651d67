//! Backend key-value contract consumed by the shard.
//!
//! A backend owns pools (named key-value namespaces backed by one or more
//! contiguous memory regions) and hands out value addresses that stay stable
//! while the entry is locked. The shard composes exactly one backend per
//! worker; all calls are made from that worker's thread.

use std::fmt;

pub mod status;

pub use status::Status;

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, Status>;

/// Opaque pool identifier. Zero is never a valid pool.
pub type PoolId = u64;

/// Values reported for [`Attribute::MemoryType`].
pub mod memory_type {
    pub const DRAM: u64 = 1;
    pub const PMEM: u64 = 2;
}

bitflags::bitflags! {
    /// Flags accepted by pool create and put operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StoreFlags: u32 {
        /// Fail if the target already exists.
        const CREATE_ONLY = 1 << 0;
        /// Refuse to overwrite an existing value.
        const DONT_STOMP = 1 << 1;
        /// Open for read access only.
        const READ_ONLY = 1 << 2;
    }
}

/// Lock mode requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Opaque handle for a held lock, stable for the duration of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(pub u64);

/// Successful lock result.
///
/// `created` is set when a write lock materialized the entry on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub handle: LockHandle,
    pub addr: u64,
    pub len: u64,
    pub created: bool,
}

/// One contiguous virtual-address segment of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub len: u64,
}

/// Attribute queries forwarded from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Count,
    ValueLen,
    MemoryType,
    PercentUsed,
    Crc32,
}

impl Attribute {
    pub fn to_u32(self) -> u32 {
        match self {
            Attribute::Count => 1,
            Attribute::ValueLen => 2,
            Attribute::MemoryType => 3,
            Attribute::PercentUsed => 4,
            Attribute::Crc32 => 5,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Attribute::Count),
            2 => Some(Attribute::ValueLen),
            3 => Some(Attribute::MemoryType),
            4 => Some(Attribute::PercentUsed),
            5 => Some(Attribute::Crc32),
            _ => None,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Count => write!(f, "count"),
            Attribute::ValueLen => write!(f, "value_len"),
            Attribute::MemoryType => write!(f, "memory_type"),
            Attribute::PercentUsed => write!(f, "percent_used"),
            Attribute::Crc32 => write!(f, "crc32"),
        }
    }
}

/// Opaque pool-iterator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterHandle(pub u64);

/// One dereferenced iterator position.
#[derive(Debug, Clone)]
pub struct IterEntry {
    pub key: Vec<u8>,
    pub value_addr: u64,
    pub value_len: u64,
    /// Entry write timestamp, epoch seconds.
    pub timestamp: u64,
    /// Whether the entry falls inside the requested time bounds.
    pub time_match: bool,
}

/// Half-open time bounds in epoch seconds; zero means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub begin: u64,
    pub end: u64,
}

impl TimeRange {
    pub const UNBOUNDED: TimeRange = TimeRange { begin: 0, end: 0 };

    pub fn is_bounded(&self) -> bool {
        self.begin != 0 || self.end != 0
    }

    pub fn contains(&self, t: u64) -> bool {
        (self.begin == 0 || self.begin <= t) && (self.end == 0 || t < self.end)
    }
}

/// Backend key-value store interface.
///
/// All methods are called from the owning shard thread only. Value addresses
/// returned by [`KvStore::lock`] remain valid until the matching unlock.
pub trait KvStore {
    fn create_pool(
        &mut self,
        name: &str,
        size: u64,
        flags: StoreFlags,
        expected_count: u64,
    ) -> Result<PoolId>;

    fn open_pool(&mut self, name: &str) -> Result<PoolId>;

    fn close_pool(&mut self, pool: PoolId) -> Result<()>;

    fn delete_pool(&mut self, name: &str) -> Result<()>;

    /// Live region layout of a pool, plus an optional backing-file name.
    ///
    /// Backends without a fixed layout answer `Err(Status::NotSupported)`.
    fn pool_regions(&mut self, pool: PoolId) -> Result<(Option<String>, Vec<Region>)>;

    fn put(&mut self, pool: PoolId, key: &[u8], value: &[u8], flags: StoreFlags) -> Result<()>;

    fn erase(&mut self, pool: PoolId, key: &[u8]) -> Result<()>;

    /// Lock an entry, creating it when `kind` is `Write` and `requested_len`
    /// is non-zero and no entry exists yet.
    fn lock(
        &mut self,
        pool: PoolId,
        key: &[u8],
        kind: LockKind,
        requested_len: u64,
    ) -> Result<LockGrant>;

    fn unlock(&mut self, pool: PoolId, handle: LockHandle, flush: bool) -> Result<()>;

    /// Exchange the stored values of two keys; value addresses move with the
    /// swap. Both entries must exist and be unlocked.
    fn swap_keys(&mut self, pool: PoolId, a: &[u8], b: &[u8]) -> Result<()>;

    fn get_attribute(&mut self, pool: PoolId, attr: Attribute, key: Option<&[u8]>) -> Result<u64>;

    fn allocate_pool_memory(&mut self, pool: PoolId, size: u64, align: u64) -> Result<u64>;

    fn free_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()>;

    fn flush_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()>;

    /// Resize an unlocked entry, preserving the common prefix of the value.
    fn resize_value(&mut self, pool: PoolId, key: &[u8], new_len: u64, align: u64) -> Result<()>;

    /// Visit entries, optionally restricted to a write-time range. Returns
    /// the number of entries visited.
    fn map(
        &mut self,
        pool: PoolId,
        f: &mut dyn FnMut(&[u8], u64, u64, u64),
        bounds: TimeRange,
    ) -> Result<u64>;

    /// Visit keys only. Returns the number of keys visited.
    fn map_keys(&mut self, pool: PoolId, f: &mut dyn FnMut(&[u8])) -> Result<u64>;

    fn open_pool_iterator(&mut self, pool: PoolId) -> Result<IterHandle>;

    /// Advance the iterator one entry. `Err(Status::OutOfBounds)` at the end.
    fn deref_pool_iterator(
        &mut self,
        pool: PoolId,
        it: IterHandle,
        bounds: TimeRange,
    ) -> Result<IterEntry>;

    fn close_pool_iterator(&mut self, pool: PoolId, it: IterHandle) -> Result<()>;

    fn count(&mut self, pool: PoolId) -> Result<u64>;

    fn is_pool_open(&self, pool: PoolId) -> bool;
}

/// Match policy for index find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindType {
    Exact,
    Regex,
    Prefix,
    Next,
}

impl FindType {
    pub fn to_u32(self) -> u32 {
        match self {
            FindType::Exact => 1,
            FindType::Regex => 2,
            FindType::Prefix => 3,
            FindType::Next => 4,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(FindType::Exact),
            2 => Some(FindType::Regex),
            3 => Some(FindType::Prefix),
            4 => Some(FindType::Next),
            _ => None,
        }
    }
}

/// Volatile key index kept beside a pool.
///
/// `find` scans at most `max_comparisons` positions starting at `begin`;
/// `Err(Status::More)` means the budget ran out and the caller should resume
/// from the returned position on a later call.
pub trait KvIndex {
    fn insert(&mut self, key: &[u8]);
    fn remove(&mut self, key: &[u8]);
    fn count(&self) -> u64;
    fn find(
        &self,
        expr: &str,
        begin: u64,
        find_type: FindType,
        max_comparisons: u64,
    ) -> Result<(u64, Vec<u8>)>;
}
