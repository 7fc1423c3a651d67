//! File-backed backend.
//!
//! Each pool is one file, mapped shared; values and pool memory are carved
//! from the mapping with a bump allocator, and flushes issue real cache-line
//! write-back. The key catalog itself is volatile: rebuilding it from a
//! previous run's layout is the embedding process's startup concern.

mod flush;
mod region;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use slab::Slab;
use tracing::debug;

use kvapi::{
    memory_type, Attribute, IterEntry, IterHandle, KvStore, LockGrant, LockHandle, LockKind,
    PoolId, Region, Result, Status, StoreFlags, TimeRange,
};
use region::PoolFile;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

struct FileEntry {
    offset: u64,
    len: u64,
    timestamp: u64,
    lock: LockState,
}

struct OpenPool {
    name: String,
    file: PoolFile,
    used: u64,
    entries: HashMap<Vec<u8>, FileEntry>,
    open_refs: u32,
}

impl OpenPool {
    fn addr_of(&self, e: &FileEntry) -> u64 {
        self.file.base() + e.offset
    }

    fn alloc_span(&mut self, size: u64, align: u64) -> Result<u64> {
        let offset = align_up(self.used, align.max(8));
        if offset + size > self.file.len() as u64 {
            return Err(Status::InsufficientSpace);
        }
        self.used = offset + size;
        Ok(offset)
    }

    fn write_span(&mut self, offset: u64, bytes: &[u8]) {
        let s = self.file.as_slice_mut();
        s[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        unsafe { flush::persist(s[offset as usize..].as_ptr(), bytes.len()) };
    }

    fn zero_span(&mut self, offset: u64, len: u64) {
        let s = self.file.as_slice_mut();
        s[offset as usize..(offset + len) as usize].fill(0);
        unsafe { flush::persist(s[offset as usize..].as_ptr(), len as usize) };
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

pub struct FileStore {
    dir: PathBuf,
    pools: HashMap<PoolId, OpenPool>,
    by_name: HashMap<String, PoolId>,
    next_pool: PoolId,
    locks: Slab<LockRec>,
    iters: Slab<IterState>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(FileStore {
            dir,
            pools: HashMap::new(),
            by_name: HashMap::new(),
            next_pool: 1,
            locks: Slab::new(),
            iters: Slab::new(),
        })
    }

    fn pool_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.pool"))
    }

    fn pool(&self, pool: PoolId) -> Result<&OpenPool> {
        self.pools.get(&pool).ok_or(Status::PoolError)
    }

    fn pool_mut(&mut self, pool: PoolId) -> Result<&mut OpenPool> {
        self.pools.get_mut(&pool).ok_or(Status::PoolError)
    }
}

impl KvStore for FileStore {
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
            self.pools.get_mut(&id).ok_or(Status::PoolError)?.open_refs += 1;
            return Ok(id);
        }
        let path = self.pool_path(name);
        if path.exists() {
            if flags.contains(StoreFlags::CREATE_ONLY) {
                return Err(Status::AlreadyExists);
            }
            return self.open_pool(name);
        }
        let file = PoolFile::create(&path, size.max(1) as usize).map_err(|e| {
            debug!(name, %e, "pool file create failed");
            Status::PoolError
        })?;
        let id = self.next_pool;
        self.next_pool += 1;
        self.pools.insert(
            id,
            OpenPool {
                name: name.to_string(),
                file,
                used: 0,
                entries: HashMap::new(),
                open_refs: 1,
            },
        );
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn open_pool(&mut self, name: &str) -> Result<PoolId> {
        if let Some(&id) = self.by_name.get(name) {
            self.pools.get_mut(&id).ok_or(Status::PoolError)?.open_refs += 1;
            return Ok(id);
        }
        let path = self.pool_path(name);
        let file = PoolFile::open(&path).map_err(|_| Status::KeyNotFound)?;
        let id = self.next_pool;
        self.next_pool += 1;
        self.pools.insert(
            id,
            OpenPool {
                name: name.to_string(),
                file,
                used: 0,
                entries: HashMap::new(),
                open_refs: 1,
            },
        );
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    fn close_pool(&mut self, pool: PoolId) -> Result<()> {
        let p = self.pools.get_mut(&pool).ok_or(Status::PoolError)?;
        p.open_refs = p.open_refs.saturating_sub(1);
        if p.open_refs == 0 {
            let name = p.name.clone();
            self.pools.remove(&pool);
            self.by_name.remove(&name);
        }
        Ok(())
    }

    fn delete_pool(&mut self, name: &str) -> Result<()> {
        if self.by_name.contains_key(name) {
            return Err(Status::AlreadyOpen);
        }
        let path = self.pool_path(name);
        if !path.exists() {
            return Err(Status::KeyNotFound);
        }
        std::fs::remove_file(path).map_err(|_| Status::Fail)
    }

    fn pool_regions(&mut self, pool: PoolId) -> Result<(Option<String>, Vec<Region>)> {
        let p = self.pool(pool)?;
        Ok((
            Some(format!("{}.pool", p.name)),
            vec![Region {
                addr: p.file.base(),
                len: p.file.len() as u64,
            }],
        ))
    }

    fn put(&mut self, pool: PoolId, key: &[u8], value: &[u8], flags: StoreFlags) -> Result<()> {
        let p = self.pool_mut(pool)?;
        if let Some(e) = p.entries.get(key) {
            if e.lock != LockState::Unlocked {
                return Err(Status::Locked);
            }
            if flags.contains(StoreFlags::DONT_STOMP) || flags.contains(StoreFlags::CREATE_ONLY) {
                return Err(Status::AlreadyExists);
            }
        }
        let offset = p.alloc_span(value.len().max(1) as u64, 8)?;
        p.write_span(offset, value);
        p.entries.insert(
            key.to_vec(),
            FileEntry {
                offset,
                len: value.len() as u64,
                timestamp: now_secs(),
                lock: LockState::Unlocked,
            },
        );
        Ok(())
    }

    fn erase(&mut self, pool: PoolId, key: &[u8]) -> Result<()> {
        let p = self.pool_mut(pool)?;
        match p.entries.get(key) {
            None => Err(Status::KeyNotFound),
            Some(e) if e.lock != LockState::Unlocked => Err(Status::Locked),
            Some(_) => {
                // Span stays allocated; the bump allocator does not recycle.
                p.entries.remove(key);
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
        let p = self.pools.get_mut(&pool).ok_or(Status::PoolError)?;
        let mut created = false;
        if !p.entries.contains_key(key) {
            if kind == LockKind::Read || requested_len == 0 {
                return Err(Status::KeyNotFound);
            }
            let offset = p.alloc_span(requested_len, 8)?;
            p.zero_span(offset, requested_len);
            p.entries.insert(
                key.to_vec(),
                FileEntry {
                    offset,
                    len: requested_len,
                    timestamp: now_secs(),
                    lock: LockState::Unlocked,
                },
            );
            created = true;
        }
        let base = p.file.base();
        let entry = p.entries.get_mut(key).ok_or(Status::Fail)?;
        match (kind, entry.lock) {
            (LockKind::Read, LockState::Unlocked) => entry.lock = LockState::Shared(1),
            (LockKind::Read, LockState::Shared(n)) => entry.lock = LockState::Shared(n + 1),
            (LockKind::Read, LockState::Exclusive) => return Err(Status::Locked),
            (LockKind::Write, LockState::Unlocked) => entry.lock = LockState::Exclusive,
            (LockKind::Write, _) => return Err(Status::Locked),
        }
        let addr = base + entry.offset;
        let len = entry.len;
        Ok(LockGrant {
            handle: LockHandle(self.locks.insert(LockRec {
                pool,
                key: key.to_vec(),
                kind,
            }) as u64),
            addr,
            len,
            created,
        })
    }

    fn unlock(&mut self, pool: PoolId, handle: LockHandle, flush: bool) -> Result<()> {
        let idx = handle.0 as usize;
        if !self.locks.contains(idx) {
            return Err(Status::Inval);
        }
        let rec = self.locks.remove(idx);
        if rec.pool != pool {
            return Err(Status::Inval);
        }
        let p = self.pools.get_mut(&pool).ok_or(Status::PoolError)?;
        let base = p.file.base();
        let entry = p.entries.get_mut(&rec.key).ok_or(Status::KeyNotFound)?;
        entry.lock = match (rec.kind, entry.lock) {
            (LockKind::Read, LockState::Shared(1)) => LockState::Unlocked,
            (LockKind::Read, LockState::Shared(n)) if n > 1 => LockState::Shared(n - 1),
            (LockKind::Write, LockState::Exclusive) => LockState::Unlocked,
            _ => return Err(Status::Inval),
        };
        if rec.kind == LockKind::Write {
            entry.timestamp = now_secs();
            if flush {
                unsafe {
                    flush::persist((base + entry.offset) as *const u8, entry.len as usize)
                };
            }
        }
        Ok(())
    }

    fn swap_keys(&mut self, pool: PoolId, a: &[u8], b: &[u8]) -> Result<()> {
        let p = self.pool_mut(pool)?;
        for k in [a, b] {
            match p.entries.get(k) {
                None => return Err(Status::KeyNotFound),
                Some(e) if e.lock != LockState::Unlocked => return Err(Status::Locked),
                Some(_) => {}
            }
        }
        let mut ea = p.entries.remove(a).ok_or(Status::Fail)?;
        let eb = p.entries.get_mut(b).ok_or(Status::Fail)?;
        std::mem::swap(&mut ea.offset, &mut eb.offset);
        std::mem::swap(&mut ea.len, &mut eb.len);
        std::mem::swap(&mut ea.timestamp, &mut eb.timestamp);
        p.entries.insert(a.to_vec(), ea);
        Ok(())
    }

    fn get_attribute(&mut self, pool: PoolId, attr: Attribute, key: Option<&[u8]>) -> Result<u64> {
        let p = self.pool(pool)?;
        match attr {
            Attribute::Count => Ok(p.entries.len() as u64),
            Attribute::ValueLen => {
                let key = key.ok_or(Status::BadParam)?;
                p.entries.get(key).map(|e| e.len).ok_or(Status::KeyNotFound)
            }
            Attribute::MemoryType => Ok(memory_type::PMEM),
            Attribute::PercentUsed => Ok(p.used * 100 / p.file.len().max(1) as u64),
            Attribute::Crc32 => Err(Status::NotSupported),
        }
    }

    fn allocate_pool_memory(&mut self, pool: PoolId, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(Status::BadParam);
        }
        let p = self.pool_mut(pool)?;
        let offset = p.alloc_span(size, align)?;
        Ok(p.file.base() + offset)
    }

    fn free_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()> {
        let p = self.pool_mut(pool)?;
        let base = p.file.base();
        if addr < base || addr + size > base + p.file.len() as u64 {
            return Err(Status::Inval);
        }
        Ok(())
    }

    fn flush_pool_memory(&mut self, pool: PoolId, addr: u64, size: u64) -> Result<()> {
        let p = self.pool(pool)?;
        let base = p.file.base();
        if addr < base || addr + size > base + p.file.len() as u64 {
            return Err(Status::Inval);
        }
        unsafe { flush::persist(addr as *const u8, size as usize) };
        Ok(())
    }

    fn resize_value(&mut self, pool: PoolId, key: &[u8], new_len: u64, align: u64) -> Result<()> {
        let p = self.pool_mut(pool)?;
        let entry = p.entries.get(key).ok_or(Status::KeyNotFound)?;
        if entry.lock != LockState::Unlocked {
            return Err(Status::Locked);
        }
        let (old_offset, old_len) = (entry.offset, entry.len);
        let new_offset = p.alloc_span(new_len, align)?;
        p.zero_span(new_offset, new_len);
        let n = old_len.min(new_len) as usize;
        let s = p.file.as_slice_mut();
        s.copy_within(
            old_offset as usize..old_offset as usize + n,
            new_offset as usize,
        );
        unsafe { flush::persist(s[new_offset as usize..].as_ptr(), n) };
        let entry = p.entries.get_mut(key).ok_or(Status::Fail)?;
        entry.offset = new_offset;
        entry.len = new_len;
        entry.timestamp = now_secs();
        Ok(())
    }

    fn map(
        &mut self,
        pool: PoolId,
        f: &mut dyn FnMut(&[u8], u64, u64, u64),
        bounds: TimeRange,
    ) -> Result<u64> {
        let p = self.pool(pool)?;
        let mut visited = 0;
        for (key, entry) in &p.entries {
            if bounds.is_bounded() && !bounds.contains(entry.timestamp) {
                continue;
            }
            f(key, p.addr_of(entry), entry.len, entry.timestamp);
            visited += 1;
        }
        Ok(visited)
    }

    fn map_keys(&mut self, pool: PoolId, f: &mut dyn FnMut(&[u8])) -> Result<u64> {
        let p = self.pool(pool)?;
        for key in p.entries.keys() {
            f(key);
        }
        Ok(p.entries.len() as u64)
    }

    fn open_pool_iterator(&mut self, pool: PoolId) -> Result<IterHandle> {
        let mut keys: Vec<Vec<u8>> = {
            let p = self.pool(pool)?;
            p.entries.keys().cloned().collect()
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
        let p = self.pools.get(&pool).ok_or(Status::PoolError)?;
        let state = self.iters.get_mut(it.0 as usize).ok_or(Status::Inval)?;
        if state.pool != pool {
            return Err(Status::Inval);
        }
        loop {
            let key = state.keys.get(state.pos).ok_or(Status::OutOfBounds)?;
            state.pos += 1;
            if let Some(entry) = p.entries.get(key) {
                return Ok(IterEntry {
                    key: key.clone(),
                    value_addr: p.addr_of(entry),
                    value_len: entry.len,
                    timestamp: entry.timestamp,
                    time_match: !bounds.is_bounded() || bounds.contains(entry.timestamp),
                });
            }
        }
    }

    fn close_pool_iterator(&mut self, pool: PoolId, it: IterHandle) -> Result<()> {
        let idx = it.0 as usize;
        if !self.iters.contains(idx) || self.iters[idx].pool != pool {
            return Err(Status::Inval);
        }
        self.iters.remove(idx);
        Ok(())
    }

    fn count(&mut self, pool: PoolId) -> Result<u64> {
        Ok(self.pool(pool)?.entries.len() as u64)
    }

    fn is_pool_open(&self, pool: PoolId) -> bool {
        self.pools.contains_key(&pool)
    }
}
