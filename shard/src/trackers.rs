//! Lock, space, and pending-rename tracking.
//!
//! Lock entries are keyed by the value's virtual address (unique within a
//! shard while the value is pinned), space entries by their pool offset
//! range. Per-entry counts let the same owner register the same value twice
//! without double-freeing; the memory registration is dropped with the
//! entry.

use std::collections::HashMap;

use fabric::MemoryRegistration;
use kvapi::{LockHandle, PoolId};
use tracing::debug;

use crate::dispatch::FatalError;

pub struct LockedValue {
    pub pool: PoolId,
    pub handle: LockHandle,
    pub len: u64,
    registration: MemoryRegistration,
    count: u32,
}

impl LockedValue {
    pub fn rkey(&self) -> u64 {
        self.registration.rkey()
    }
}

/// One table instance per lock kind (shared, exclusive).
#[derive(Default)]
pub struct LockedValueMap {
    entries: HashMap<u64, LockedValue>,
}

impl LockedValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locked value. Re-adding an already tracked address bumps
    /// its count; the first registration and lock handle stay
    /// authoritative. Returns true when the entry pre-existed, in which
    /// case the caller must return the duplicate backend lock.
    pub fn add(
        &mut self,
        pool: PoolId,
        handle: LockHandle,
        addr: u64,
        len: u64,
        registration: MemoryRegistration,
    ) -> bool {
        match self.entries.get_mut(&addr) {
            Some(e) => {
                e.count += 1;
                true
            }
            None => {
                self.entries.insert(
                    addr,
                    LockedValue {
                        pool,
                        handle,
                        len,
                        registration,
                        count: 1,
                    },
                );
                false
            }
        }
    }

    /// Drop one count. At zero the entry is removed and `(pool, handle)` is
    /// returned so the caller can unlock the backend. An unknown address is
    /// an invariant violation.
    pub fn release(&mut self, addr: u64) -> Result<Option<(PoolId, LockHandle)>, FatalError> {
        match self.entries.get_mut(&addr) {
            None => Err(FatalError::new(format!(
                "release of address never locked ({addr:#x})"
            ))),
            Some(e) if e.count > 1 => {
                e.count -= 1;
                Ok(None)
            }
            Some(_) => {
                let e = self.entries.remove(&addr).unwrap();
                Ok(Some((e.pool, e.handle)))
            }
        }
    }

    pub fn get(&self, addr: u64) -> Option<&LockedValue> {
        self.entries.get(&addr)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct SpaceEntry {
    registration: MemoryRegistration,
    count: u32,
}

/// Offset-range registrations for direct transfers not tied to a key.
#[derive(Default)]
pub struct SpaceMap {
    entries: HashMap<(u64, u64), SpaceEntry>,
}

impl SpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: (u64, u64), registration: MemoryRegistration) {
        let count = match self.entries.get_mut(&range) {
            Some(e) => {
                e.count += 1;
                e.count
            }
            None => {
                self.entries.insert(
                    range,
                    SpaceEntry {
                        registration,
                        count: 1,
                    },
                );
                1
            }
        };
        debug!(lo = range.0, hi = range.1, count, "space add");
    }

    /// Returns true when the entry was removed. An unknown range is an
    /// invariant violation.
    pub fn release(&mut self, range: (u64, u64)) -> Result<bool, FatalError> {
        match self.entries.get_mut(&range) {
            None => Err(FatalError::new(format!(
                "release of space never located ([{:#x}..{:#x}))",
                range.0, range.1
            ))),
            Some(e) if e.count > 1 => {
                e.count -= 1;
                Ok(false)
            }
            Some(_) => {
                self.entries.remove(&range);
                Ok(true)
            }
        }
    }

    pub fn rkey(&self, range: (u64, u64)) -> Option<u64> {
        self.entries.get(&range).map(|e| e.registration.rkey())
    }

    pub fn contains(&self, range: (u64, u64)) -> bool {
        self.entries.contains_key(&range)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The `(pool, temporary key, final key)` triple discharged at release.
#[derive(Debug, Clone)]
pub struct PendingRename {
    pub pool: PoolId,
    pub from: Vec<u8>,
    pub to: Vec<u8>,
}

#[derive(Default)]
pub struct PendingRenameMap {
    entries: HashMap<u64, PendingRename>,
}

impl PendingRenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        addr: u64,
        pool: PoolId,
        from: Vec<u8>,
        to: Vec<u8>,
    ) -> Result<(), FatalError> {
        if self.entries.contains_key(&addr) {
            return Err(FatalError::new(format!(
                "duplicate pending rename for {addr:#x}"
            )));
        }
        self.entries.insert(addr, PendingRename { pool, from, to });
        Ok(())
    }

    /// Remove and return the rename for `addr`. `None` is not an error: a
    /// shared (get-direct) release has no rename recorded.
    pub fn take(&mut self, addr: u64) -> Option<PendingRename> {
        self.entries.remove(&addr)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
