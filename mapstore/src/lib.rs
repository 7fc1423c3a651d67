//! Volatile in-memory backend.
//!
//! Pools live in a process-local catalog that survives close/reopen; values
//! are individually boxed so their addresses stay stable while locked. Each
//! pool also owns one or more arena regions that back offset-addressed
//! transfers and `allocate_pool_memory`.
//!
//! No `Arc`, no atomics: a `MapStore` is exclusively owned by one shard
//! thread.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use slab::Slab;
use tracing::debug;

use kvapi::{
    memory_type, Attribute, IterEntry, IterHandle, KvStore, LockGrant, LockHandle, LockKind,
    PoolId, Region, Result, Status, StoreFlags, TimeRange,
};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn align_up(v: u64, align: u64) -> u64 {
    if align <= 1 {
        return v;
    }
    (v + align - 1) / align * align
}

// === Entries and pools ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

struct Entry {
    value: Box<[u8]>,
    timestamp: u64,
    lock: LockState,
}

impl Entry {
    fn new(value: Box<[u8]>) -> Self {
        Entry {
            value,
            timestamp: now_secs(),
            lock: LockState::Unlocked,
        }
    }

    fn addr(&self) -> u64 {
        self.value.as_ptr() as u64
    }
}

struct Arena {
    buf: Box<[u8]>,
    used: u64,
    freed: u64,
}

impl Arena {
    fn base(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        self.base() <= addr && addr + size <= self.base() + self.len()
    }
}

struct PoolData {
    entries: HashMap<Vec<u8>, Entry>,
    arenas: Vec<Arena>,
    open_refs: u32,
}

impl PoolData {
    fn new(size: u64, region_cap: u64) -> Self {
        let mut arenas = Vec::new();
        let mut remaining = size.max(1);
        while remaining > 0 {
            let n = remaining.min(region_cap);
            arenas.push(Arena {
                buf: vec![0u8; n as usize].into_boxed_slice(),
                used: 0,
                freed: 0,
            });
            remaining -= n;
        }
        PoolData {
            entries: HashMap::new(),
            arenas,
            open_refs: 0,
        }
    }
}

struct LockRec {
    pool: PoolId,
    key: Vec<u8>,
    kind: LockKind,
}

struct IterState {
    pool: PoolId,
    keys: Vec<Vec<u8>>,
    pos: usize,
}

// === Store ===

pub struct MapStore {
    catalog: HashMap<String, PoolData>,
    open: HashMap<PoolId, String>,
    by_name: HashMap<String, PoolId>,
    next_pool: PoolId,
    locks: Slab<LockRec>,
    iters: Slab<IterState>,
    region_cap: u64,
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MapStore {
    pub fn new() -> Self {
        Self::with_region_cap(u64::MAX)
    }

    /// Cap the size of a single pool region; pools larger than the cap are
    /// backed by several regions. Mainly useful for exercising multi-region
    /// offset mapping.
    pub fn with_region_cap(region_cap: u64) -> Self {
        MapStore {
            catalog: HashMap::new(),
            open: HashMap::new(),
            by_name: HashMap::new(),
            next_pool: 1,
            locks: Slab::new(),
            iters: Slab::new(),
            region_cap: region_cap.max(1),
        }
    }

    fn data(&self, pool: PoolId) -> Result<&PoolData> {
        let name = self.open.get(&pool).ok_or(Status::PoolError)?;
        self.catalog.get(name).ok_or(Status::PoolError)
    }

    fn data_mut(&mut self, pool: PoolId) -> Result<&mut PoolData> {
        let name = self.open.get(&pool).ok_or(Status::PoolError)?;
        self.catalog.get_mut(name).ok_or(Status::PoolError)
    }
}

impl KvStore for MapStore {
    fn create_pool(
        &mut self,
        name: &str,
        size: u64,
        flags: StoreFlags,
        _expected_count: u64,
    ) -> Result<PoolId> {
        if let Some(&id) = self.by_name.get(name) {
            if flags.contains(StoreFlags::CREATE_ONLY) {
                return Err(Status::AlreadyExists);
            }
            let name = name.to_string();
            self.catalog.get_mut(&name).ok_or(Status::PoolError)?.open_refs += 1;
            return Ok(id);
        }
        if self.catalog.contains_key(name) {
            if flags.contains(StoreFlags::CREATE_ONLY) {
                return Err(Status::AlreadyExists);
            }
            return self.open_pool(name);
        }
        let mut data = PoolData::new(size, self.region_cap);
        data.open_refs = 1;
        self.catalog.insert(name.to_string(), data);
        let id = self.next_pool;
        self.next_pool += 1;
        self.open.insert(id, name.to_string());
        self.by_name.insert(name.to_string(), id);
        debug!(pool = id, name, size, "created pool");
        Ok(id)
    }

    fn open_pool(&mut self, name: &str) -> Result<PoolId> {
        if let Some(&id) = self.by_name.get(name) {
            self.catalog.get_mut(name).ok_or(Status::PoolError)?.open_refs += 1;
            return Ok(id);
        }
        let data = self.catalog.get_mut(name).ok_or(Status::KeyNotFound)?;
        data.open_refs = 1;
        let id = self.next_pool;
        self.next_pool += 1;
        self.open.insert(id, name.to_string());
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn close_pool(&mut self, pool: PoolId) -> Result<()> {
        let name = self.open.get(&pool).ok_or(Status::PoolError)?.clone();
        let data = self.catalog.get_mut(&name).ok_or(Status::PoolError)?;
        data.open_refs = data.open_refs.saturating_sub(1);
        if data.open_refs == 0 {
            self.open.remove(&pool);
            self.by_name.remove(&name);
        }
        Ok(())
    }

    fn delete_pool(&mut self, name: &str) -> Result<()> {
        if self.by_name.contains_key(name) {
            return Err(Status::AlreadyOpen);
        }
        self.catalog.remove(name).map(|_| ()).ok_or(Status::KeyNotFound)
    }

    fn pool_regions(&mut self, pool: PoolId) -> Result<(Option<String>, Vec<Region>)> {
        let data = self.data(pool)?;
        let regions = data
            .arenas
            .iter()
            .map(|a| Region {
                addr: a.base(),
                len: a.len(),
            })
            .collect();
        Ok((None, regions))
    }

    fn put(&mut self, pool: PoolId, key: &[u8], value: &[u8], flags: StoreFlags) -> Result<()> {
        let data = self.data_mut(pool)?;
        if let Some(entry) = data.entries.get_mut(key) {
            if entry.lock != LockState::Unlocked {
                return Err(Status::Locked);
            }
            if flags.contains(StoreFlags::DONT_STOMP) || flags.contains(StoreFlags::CREATE_ONLY) {
                return Err(Status::AlreadyExists);
            }
            entry.value = value.to_vec().into_boxed_slice();
            entry.timestamp = now_secs();
        } else {
            data.entries
                .insert(key.to_vec(), Entry::new(value.to_vec().into_boxed_slice()));
        }
        Ok(())
    }

    fn erase(&mut self, pool: PoolId, key: &[u8]) -> Result<()> {
        let data = self.data_mut(pool)?;
        match data.entries.get(key) {
            None => Err(Status::KeyNotFound),
            Some(e) if e.lock != LockState::Unlocked => Err(Status::Locked),
            Some(_) => {
                data.entries.remove(key);
                Ok(())
            }
        }
    }

    fn lock(
        &mut self,
        pool: PoolId,
        key: &[u8],
        kind: LockKind,
        requested_len: u64,
    ) -> Result<LockGrant> {
        let mut created = false;
        let (addr, len) = {
            let data = self.data_mut(pool)?;
            if !data.entries.contains_key(key) {
                if kind == LockKind::Read || requested_len == 0 {
                    return Err(Status::KeyNotFound);
                }
                data.entries.insert(
                    key.to_vec(),
                    Entry::new(vec![0u8; requested_len as usize].into_boxed_slice()),
                );
                created = true;
            }
            let entry = data.entries.get_mut(key).ok_or(Status::Fail)?;
            match (kind, entry.lock) {
                (LockKind::Read, LockState::Unlocked) => entry.lock = LockState::Shared(1),
                (LockKind::Read, LockState::Shared(n)) => entry.lock = LockState::Shared(n + 1),
                (LockKind::Read, LockState::Exclusive) => return Err(Status::Locked),
                (LockKind::Write, LockState::Unlocked) => entry.lock = LockState::Exclusive,
                (LockKind::Write, _) => return Err(Status::Locked),
            }
            (entry.addr(), entry.value.len() as u64)
        };
        let handle = LockHandle(self.locks.insert(LockRec {
            pool,
            key: key.to_vec(),
            kind,
        }) as u64);
        Ok(LockGrant {
            handle,
            addr,
            len,
            created,
        })
    }

    fn unlock(&mut self, pool: PoolId, handle: LockHandle, _flush: bool) -> Result<()> {
        let idx = handle.0 as usize;
        if !self.locks.contains(idx) {
            return Err(Status::Inval);
        }
        let rec = self.locks.remove(idx);
        if rec.pool != pool {
            return Err(Status::Inval);
        }
        let name = self.open.get(&pool).ok_or(Status::PoolError)?;
        let data = self.catalog.get_mut(name).ok_or(Status::PoolError)?;
        let entry = data.entries.get_mut(&rec.key).ok_or(Status::KeyNotFound)?;
        entry.lock = match (rec.kind, entry.lock) {
            (LockKind::Read, LockState::Shared(1)) => LockState::Unlocked,
            (LockKind::Read, LockState::Shared(n)) if n > 1 => LockState::Shared(n - 1),
            (LockKind::Write, LockState::Exclusive) => LockState::Unlocked,
            _ => return Err(Status::Inval),
        };
        if rec.kind == LockKind::Write {
            entry.timestamp = now_secs();
        }
        Ok(())
    }

    fn swap_keys(&mut self, pool: PoolId, a: &[u8], b: &[u8]) -> Result<()> {
        let data = self.data_mut(pool)?;
        for k in [a, b] {
            match data.entries.get(k) {
                None => return Err(Status::KeyNotFound),
                Some(e) if e.lock != LockState::Unlocked => return Err(Status::Locked),
                Some(_) => {}
            }
        }
        let mut ea = data.entries.remove(a).ok_or(Status::Fail)?;
        let eb = data.entries.get_mut(b).ok_or(Status::Fail)?;
        std::mem::swap(&mut ea.value, &mut eb.value);
        std::mem::swap(&mut ea.timestamp, &mut eb.timestamp);
        data.entries.insert(a.to_vec(), ea);
        Ok(())
    }

    fn get_attribute(&mut self, pool: PoolId, attr: Attribute, key: Option<&[u8]>) -> Result<u64> {
        let data = self.data(pool)?;
        match attr {
            Attribute::Count => Ok(data.entries.len() as u64),
            Attribute::ValueLen => {
                let key = key.ok_or(Status::BadParam)?;
                data.entries
                    .get(key)
                    .map(|e| e.value.len() as u64)
                    .ok_or(Status::KeyNotFound)
            }
            Attribute::MemoryType => Ok(memory_type::DRAM),
            Attribute::PercentUsed => {
                let used: u64 = data
                    .arenas
                    .iter()
                    .map(|a| a.used.saturating_sub(a.freed))
                    .sum();
                let total: u64 = data.arenas.iter().map(|a| a.len()).sum();
                Ok(if total == 0 { 0 } else { used * 100 / total })
            }
            Attribute::Crc32 => Err(Status::NotSupported),
        }
    }

    fn allocate_pool_memory(&mut self, pool: PoolId, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(Status::BadParam);
        }
        let data = self.data_mut(pool)?;
        for arena in &mut data.arenas {
            let offset = align_up(arena.used, align);
            if offset + size <= arena.len() {
                arena.used = offset + size;
                return Ok(arena.base() + offset);
            }
        }
        Err(Status::InsufficientSpace)
    }

    fn free_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()> {
        let data = self.data_mut(pool)?;
        for arena in &mut data.arenas {
            if arena.contains(addr, size) {
                // Bump allocator: record the free, no recycling.
                arena.freed += size;
                return Ok(());
            }
        }
        Err(Status::Inval)
    }

    fn flush_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()> {
        let data = self.data(pool)?;
        if data.arenas.iter().any(|a| a.contains(addr, size)) {
            Ok(())
        } else {
            Err(Status::Inval)
        }
    }

    fn resize_value(&mut self, pool: PoolId, key: &[u8], new_len: u64, _align: u64) -> Result<()> {
        let data = self.data_mut(pool)?;
        let entry = data.entries.get_mut(key).ok_or(Status::KeyNotFound)?;
        if entry.lock != LockState::Unlocked {
            return Err(Status::Locked);
        }
        let mut value = vec![0u8; new_len as usize];
        let n = entry.value.len().min(new_len as usize);
        value[..n].copy_from_slice(&entry.value[..n]);
        entry.value = value.into_boxed_slice();
        entry.timestamp = now_secs();
        Ok(())
    }

    fn map(
        &mut self,
        pool: PoolId,
        f: &mut dyn FnMut(&[u8], u64, u64, u64),
        bounds: TimeRange,
    ) -> Result<u64> {
        let data = self.data(pool)?;
        let mut visited = 0;
        for (key, entry) in &data.entries {
            if bounds.is_bounded() && !bounds.contains(entry.timestamp) {
                continue;
            }
            f(key, entry.addr(), entry.value.len() as u64, entry.timestamp);
            visited += 1;
        }
        Ok(visited)
    }

    fn map_keys(&mut self, pool: PoolId, f: &mut dyn FnMut(&[u8])) -> Result<u64> {
        let data = self.data(pool)?;
        for key in data.entries.keys() {
            f(key);
        }
        Ok(data.entries.len() as u64)
    }

    fn open_pool_iterator(&mut self, pool: PoolId) -> Result<IterHandle> {
        let mut keys: Vec<Vec<u8>> = {
            let data = self.data(pool)?;
            data.entries.keys().cloned().collect()
        };
        keys.sort();
        Ok(IterHandle(self.iters.insert(IterState {
            pool,
            keys,
            pos: 0,
        }) as u64))
    }

    fn deref_pool_iterator(
        &mut self,
        pool: PoolId,
        it: IterHandle,
        bounds: TimeRange,
    ) -> Result<IterEntry> {
        let name = self.open.get(&pool).ok_or(Status::PoolError)?;
        let data = self.catalog.get(name).ok_or(Status::PoolError)?;
        let state = self.iters.get_mut(it.0 as usize).ok_or(Status::Inval)?;
        if state.pool != pool {
            return Err(Status::Inval);
        }
        loop {
            let key = state.keys.get(state.pos).ok_or(Status::OutOfBounds)?;
            state.pos += 1;
            // Entries erased since the snapshot are skipped.
            if let Some(entry) = data.entries.get(key) {
                return Ok(IterEntry {
                    key: key.clone(),
                    value_addr: entry.addr(),
                    value_len: entry.value.len() as u64,
                    timestamp: entry.timestamp,
                    time_match: !bounds.is_bounded() || bounds.contains(entry.timestamp),
                });
            }
        }
    }

    fn close_pool_iterator(&mut self, pool: PoolId, it: IterHandle) -> Result<()> {
        let idx = it.0 as usize;
        if !self.iters.contains(idx) {
            return Err(Status::Inval);
        }
        if self.iters[idx].pool != pool {
            return Err(Status::Inval);
        }
        self.iters.remove(idx);
        Ok(())
    }

    fn count(&mut self, pool: PoolId) -> Result<u64> {
        Ok(self.data(pool)?.entries.len() as u64)
    }

    fn is_pool_open(&self, pool: PoolId) -> bool {
        self.open.contains_key(&pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MapStore, PoolId) {
        let mut s = MapStore::new();
        let pool = s
            .create_pool("p", 1 << 20, StoreFlags::empty(), 100)
            .unwrap();
        (s, pool)
    }

    #[test]
    fn test_put_lock_read_back() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"hello", StoreFlags::empty()).unwrap();

        let g = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        assert!(!g.created);
        assert_eq!(g.len, 5);
        let bytes =
            unsafe { std::slice::from_raw_parts(g.addr as *const u8, g.len as usize) };
        assert_eq!(bytes, b"hello");
        s.unlock(pool, g.handle, false).unwrap();
    }

    #[test]
    fn test_dont_stomp() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"v1", StoreFlags::empty()).unwrap();
        assert_eq!(
            s.put(pool, b"k", b"v2", StoreFlags::DONT_STOMP),
            Err(Status::AlreadyExists)
        );
        let g = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        let bytes =
            unsafe { std::slice::from_raw_parts(g.addr as *const u8, g.len as usize) };
        assert_eq!(bytes, b"v1");
        s.unlock(pool, g.handle, false).unwrap();
    }

    #[test]
    fn test_write_lock_creates_on_demand() {
        let (mut s, pool) = store();
        let g = s.lock(pool, b"new", LockKind::Write, 64).unwrap();
        assert!(g.created);
        assert_eq!(g.len, 64);
        // Zero-initialized.
        let bytes =
            unsafe { std::slice::from_raw_parts(g.addr as *const u8, g.len as usize) };
        assert!(bytes.iter().all(|&b| b == 0));
        s.unlock(pool, g.handle, true).unwrap();

        assert_eq!(
            s.lock(pool, b"missing", LockKind::Read, 0),
            Err(Status::KeyNotFound)
        );
    }

    #[test]
    fn test_lock_conflicts() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"v", StoreFlags::empty()).unwrap();

        let r1 = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        let r2 = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        assert_eq!(s.lock(pool, b"k", LockKind::Write, 0), Err(Status::Locked));
        s.unlock(pool, r1.handle, false).unwrap();
        assert_eq!(s.lock(pool, b"k", LockKind::Write, 0), Err(Status::Locked));
        s.unlock(pool, r2.handle, false).unwrap();

        let w = s.lock(pool, b"k", LockKind::Write, 0).unwrap();
        assert_eq!(s.lock(pool, b"k", LockKind::Read, 0), Err(Status::Locked));
        s.unlock(pool, w.handle, true).unwrap();
    }

    #[test]
    fn test_locked_entry_rejects_put_and_erase() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"v", StoreFlags::empty()).unwrap();
        let g = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        assert_eq!(s.put(pool, b"k", b"x", StoreFlags::empty()), Err(Status::Locked));
        assert_eq!(s.erase(pool, b"k"), Err(Status::Locked));
        s.unlock(pool, g.handle, false).unwrap();
        s.erase(pool, b"k").unwrap();
        assert_eq!(s.erase(pool, b"k"), Err(Status::KeyNotFound));
    }

    #[test]
    fn test_swap_keys_moves_addresses() {
        let (mut s, pool) = store();
        s.put(pool, b"a", b"aaaa", StoreFlags::empty()).unwrap();
        s.put(pool, b"b", b"bb", StoreFlags::empty()).unwrap();

        let ga = s.lock(pool, b"a", LockKind::Read, 0).unwrap();
        let addr_a = ga.addr;
        s.unlock(pool, ga.handle, false).unwrap();

        s.swap_keys(pool, b"a", b"b").unwrap();

        let gb = s.lock(pool, b"b", LockKind::Read, 0).unwrap();
        assert_eq!(gb.addr, addr_a);
        assert_eq!(gb.len, 4);
        s.unlock(pool, gb.handle, false).unwrap();
    }

    #[test]
    fn test_pool_open_refcounting() {
        let mut s = MapStore::new();
        let p1 = s.create_pool("p", 4096, StoreFlags::empty(), 0).unwrap();
        let p2 = s.open_pool("p").unwrap();
        assert_eq!(p1, p2);

        s.close_pool(p1).unwrap();
        assert!(s.is_pool_open(p1));
        s.close_pool(p1).unwrap();
        assert!(!s.is_pool_open(p1));
        assert_eq!(s.count(p1), Err(Status::PoolError));

        // Data survives close; reopen sees it.
        let p3 = s.open_pool("p").unwrap();
        assert_eq!(s.count(p3), Ok(0));
    }

    #[test]
    fn test_delete_pool_rules() {
        let mut s = MapStore::new();
        let p = s.create_pool("p", 4096, StoreFlags::empty(), 0).unwrap();
        assert_eq!(s.delete_pool("p"), Err(Status::AlreadyOpen));
        s.close_pool(p).unwrap();
        s.delete_pool("p").unwrap();
        assert_eq!(s.delete_pool("p"), Err(Status::KeyNotFound));
        assert_eq!(s.open_pool("p"), Err(Status::KeyNotFound));
    }

    #[test]
    fn test_create_only_flag() {
        let mut s = MapStore::new();
        let p = s.create_pool("p", 4096, StoreFlags::empty(), 0).unwrap();
        assert_eq!(
            s.create_pool("p", 4096, StoreFlags::CREATE_ONLY, 0),
            Err(Status::AlreadyExists)
        );
        s.close_pool(p).unwrap();
        assert_eq!(
            s.create_pool("p", 4096, StoreFlags::CREATE_ONLY, 0),
            Err(Status::AlreadyExists)
        );
    }

    #[test]
    fn test_region_cap_splits_pool() {
        let mut s = MapStore::with_region_cap(1000);
        let p = s.create_pool("p", 2500, StoreFlags::empty(), 0).unwrap();
        let (name, regions) = s.pool_regions(p).unwrap();
        assert!(name.is_none());
        let lens: Vec<u64> = regions.iter().map(|r| r.len).collect();
        assert_eq!(lens, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_pool_memory_alloc_and_free() {
        let (mut s, pool) = store();
        let a = s.allocate_pool_memory(pool, 100, 8).unwrap();
        let b = s.allocate_pool_memory(pool, 100, 8).unwrap();
        assert!(b >= a + 100);
        assert_eq!(b % 8, 0);
        s.free_pool_memory(pool, a, 100).unwrap();
        assert_eq!(s.free_pool_memory(pool, 0xdead, 8), Err(Status::Inval));

        let mut small = MapStore::new();
        let sp = small.create_pool("s", 64, StoreFlags::empty(), 0).unwrap();
        assert_eq!(
            small.allocate_pool_memory(sp, 128, 8),
            Err(Status::InsufficientSpace)
        );
    }

    #[test]
    fn test_resize_value() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"abcdef", StoreFlags::empty()).unwrap();
        s.resize_value(pool, b"k", 3, 0).unwrap();
        let g = s.lock(pool, b"k", LockKind::Read, 0).unwrap();
        let bytes =
            unsafe { std::slice::from_raw_parts(g.addr as *const u8, g.len as usize) };
        assert_eq!(bytes, b"abc");
        assert_eq!(s.resize_value(pool, b"k", 10, 0), Err(Status::Locked));
        s.unlock(pool, g.handle, false).unwrap();

        s.resize_value(pool, b"k", 10, 0).unwrap();
        assert_eq!(s.get_attribute(pool, Attribute::ValueLen, Some(b"k")), Ok(10));
    }

    #[test]
    fn test_attributes() {
        let (mut s, pool) = store();
        s.put(pool, b"k", b"hello", StoreFlags::empty()).unwrap();
        assert_eq!(s.get_attribute(pool, Attribute::Count, None), Ok(1));
        assert_eq!(
            s.get_attribute(pool, Attribute::ValueLen, Some(b"k")),
            Ok(5)
        );
        assert_eq!(
            s.get_attribute(pool, Attribute::ValueLen, Some(b"x")),
            Err(Status::KeyNotFound)
        );
        assert_eq!(
            s.get_attribute(pool, Attribute::MemoryType, None),
            Ok(memory_type::DRAM)
        );
        assert_eq!(
            s.get_attribute(pool, Attribute::Crc32, Some(b"k")),
            Err(Status::NotSupported)
        );
    }

    #[test]
    fn test_map_and_iterate() {
        let (mut s, pool) = store();
        for i in 0..5u8 {
            s.put(pool, &[b'k', b'0' + i], &[i; 4], StoreFlags::empty())
                .unwrap();
        }

        let mut seen = Vec::new();
        s.map(
            pool,
            &mut |k, _addr, len, _ts| {
                seen.push((k.to_vec(), len));
            },
            TimeRange::UNBOUNDED,
        )
        .unwrap();
        assert_eq!(seen.len(), 5);

        let it = s.open_pool_iterator(pool).unwrap();
        let mut keys = Vec::new();
        loop {
            match s.deref_pool_iterator(pool, it, TimeRange::UNBOUNDED) {
                Ok(e) => keys.push(e.key),
                Err(Status::OutOfBounds) => break,
                Err(other) => panic!("unexpected {other}"),
            }
        }
        s.close_pool_iterator(pool, it).unwrap();
        assert_eq!(keys.len(), 5);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        // Bounds beyond all timestamps see nothing.
        let n = s
            .map(
                pool,
                &mut |_, _, _, _| {},
                TimeRange {
                    begin: u64::MAX - 1,
                    end: u64::MAX,
                },
            )
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_unlock_bad_handle() {
        let (mut s, pool) = store();
        assert_eq!(s.unlock(pool, LockHandle(999), false), Err(Status::Inval));
    }
}
