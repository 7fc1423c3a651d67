//! Outstanding ADO work requests.

use adoproto::WorkId;
use kvapi::{LockHandle, LockKind, PoolId};
use kvwire::AdoFlags;
use slab::Slab;

/// Record of one in-flight ADO invocation.
#[derive(Debug, Clone)]
pub struct WorkRecord {
    /// Token of the session that issued the request.
    pub session: u64,
    pub pool: PoolId,
    pub lock_handle: Option<LockHandle>,
    pub key: Vec<u8>,
    pub lock_kind: LockKind,
    pub request_id: u64,
    pub flags: AdoFlags,
}

impl WorkRecord {
    pub fn is_async(&self) -> bool {
        self.flags.contains(AdoFlags::ASYNC)
    }
}

/// Slab of work records. The work id handed to the ADO is
/// `(generation << 32) | slot`, so a stale id from a misbehaving plugin
/// never resolves to a recycled slot.
#[derive(Default)]
pub struct WorkTable {
    slab: Slab<(u32, WorkRecord)>,
    next_generation: u32,
}

impl WorkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: WorkRecord) -> WorkId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = self.slab.insert((generation, record));
        ((generation as u64) << 32) | slot as u64
    }

    fn split(work_id: WorkId) -> (u32, usize) {
        ((work_id >> 32) as u32, (work_id & 0xffff_ffff) as usize)
    }

    pub fn get(&self, work_id: WorkId) -> Option<&WorkRecord> {
        let (generation, slot) = Self::split(work_id);
        match self.slab.get(slot) {
            Some((g, record)) if *g == generation => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, work_id: WorkId) -> Option<&mut WorkRecord> {
        let (generation, slot) = Self::split(work_id);
        match self.slab.get_mut(slot) {
            Some((g, record)) if *g == generation => Some(record),
            _ => None,
        }
    }

    pub fn remove(&mut self, work_id: WorkId) -> Option<WorkRecord> {
        let (generation, slot) = Self::split(work_id);
        match self.slab.get(slot) {
            Some((g, _)) if *g == generation => Some(self.slab.remove(slot).1),
            _ => None,
        }
    }

    pub fn contains(&self, work_id: WorkId) -> bool {
        self.get(work_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: u64) -> WorkRecord {
        WorkRecord {
            session: 1,
            pool: 2,
            lock_handle: None,
            key: b"k".to_vec(),
            lock_kind: LockKind::Write,
            request_id,
            flags: AdoFlags::empty(),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut t = WorkTable::new();
        let id = t.insert(record(7));
        assert!(t.contains(id));
        assert_eq!(t.get(id).unwrap().request_id, 7);
        let r = t.remove(id).unwrap();
        assert_eq!(r.request_id, 7);
        assert!(!t.contains(id));
        assert!(t.remove(id).is_none());
    }

    #[test]
    fn test_stale_id_does_not_resolve_recycled_slot() {
        let mut t = WorkTable::new();
        let a = t.insert(record(1));
        t.remove(a).unwrap();
        // Same slot, new generation.
        let b = t.insert(record(2));
        assert_ne!(a, b);
        assert!(t.get(a).is_none());
        assert_eq!(t.get(b).unwrap().request_id, 2);
    }
}
