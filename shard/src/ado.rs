//! ADO orchestration: proxy lifetime, request dispatch, completion drain,
//! and callback handling.

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use adoproto::{
    configure_options, table_op_flags, AdoCallback, AdoProxy, BufferSource, OpEvent, PoolDesc,
    ReferenceVector, TableOp, WorkCompletion, WorkRequest,
};
use kvapi::{Attribute, FindType, KvIndex, LockKind, PoolId, Region, Status, StoreFlags};
use kvwire::{AdoFlags, AdoRequest, AdoResponse, PutAdoRequest};

use crate::dispatch::{DispatchError, FatalError};
use crate::shard::{find_session_mut, Core, Session};
use crate::work::WorkRecord;

const PAGE_SIZE: u64 = 4096;

fn round_up(v: u64, align: u64) -> u64 {
    (v + align - 1) / align * align
}

struct AdoCell {
    proxy: RefCell<Box<dyn AdoProxy>>,
    shutdown_sent: Cell<bool>,
}

/// Reference-counted handle to one ADO proxy. The last handle to go away
/// sends `shutdown` exactly once; explicit release paths do the same ahead
/// of time so lifetime locks can be returned to the backend first.
pub struct AdoHandle {
    cell: Rc<AdoCell>,
}

impl AdoHandle {
    pub fn new(proxy: Box<dyn AdoProxy>) -> Self {
        AdoHandle {
            cell: Rc::new(AdoCell {
                proxy: RefCell::new(proxy),
                shutdown_sent: Cell::new(false),
            }),
        }
    }

    pub fn proxy(&self) -> RefMut<'_, Box<dyn AdoProxy>> {
        self.cell.proxy.borrow_mut()
    }

    /// Live handle count, including this one.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.cell)
    }

    pub fn same(&self, other: &AdoHandle) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn shutdown_once(&self) {
        if !self.cell.shutdown_sent.replace(true) {
            self.cell.proxy.borrow_mut().shutdown();
        }
    }
}

impl Clone for AdoHandle {
    fn clone(&self) -> Self {
        AdoHandle {
            cell: self.cell.clone(),
        }
    }
}

impl Drop for AdoHandle {
    fn drop(&mut self) {
        if Rc::strong_count(&self.cell) == 1 {
            self.shutdown_once();
        }
    }
}

/// Pool-map entry: the proxy, the session that bootstrapped it, and the
/// per-pool reference count.
pub(crate) struct AdoPoolEntry {
    pub handle: AdoHandle,
    pub session: u64,
    pub refs: u32,
}

fn error_response(
    sess: &mut Session,
    buf: fabric::SendBuf,
    request_id: u64,
    status: Status,
    message: &str,
) {
    debug!(%status, message, "ado request refused");
    let mut resp = AdoResponse::new(status, request_id);
    resp.append(0, message.as_bytes().to_vec());
    sess.channel.post_response(buf, resp.encode());
}

impl Core {
    // === Bootstrap and lifetime ===

    /// Ensure an ADO proxy exists for `pool`, spawning and bootstrapping one
    /// unless an existing process (same pool name) can be adopted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn conditional_bootstrap_ado(
        &mut self,
        sess: &mut Session,
        pool: PoolId,
        name: &str,
        size: u64,
        flags: StoreFlags,
        expected_count: u64,
        opened_existing: bool,
    ) {
        if let Some(entry) = self.ado.pool_map.get_mut(&pool) {
            entry.refs += 1;
            return;
        }

        let (handle, bootstrap) = match self.ado.by_name.get(name) {
            Some(h) => (h.clone(), false),
            None => {
                let desc = PoolDesc {
                    name: name.to_string(),
                    size,
                    flags,
                    expected_count,
                    opened_existing,
                };
                let net_addr = self.config.net_addr();
                let auth_id = sess.channel.auth_id();
                let Some(manager) = self.ado.manager.as_mut() else {
                    return;
                };
                match manager.create(
                    auth_id,
                    pool,
                    &desc,
                    &self.config.ado_plugins,
                    &self.config.ado_params,
                    &net_addr,
                ) {
                    Ok(proxy) => {
                        info!(name, pool, "ADO process launched");
                        let h = AdoHandle::new(proxy);
                        self.ado.by_name.insert(name.to_string(), h.clone());
                        (h, true)
                    }
                    Err(s) => {
                        warn!(name, %s, "ADO launch failed");
                        return;
                    }
                }
            }
        };

        self.ado.pool_map.insert(
            pool,
            AdoPoolEntry {
                handle: handle.clone(),
                session: sess.token,
                refs: 1,
            },
        );

        if !bootstrap {
            return;
        }

        if let Err(s) = handle.proxy().bootstrap_ado(opened_existing) {
            warn!(%s, "bootstrap_ado failed");
        }

        // Expose pool regions to the plugin. Without a region layout the
        // pool cannot carry an ADO.
        match self.backend.pool_regions(pool) {
            Ok((file, regions)) => {
                let mut offset = 0u64;
                for r in regions {
                    let len = round_up(r.len, PAGE_SIZE);
                    match &file {
                        Some(f) => handle.proxy().send_memory_map_named(
                            0,
                            f,
                            offset,
                            Region { addr: r.addr, len },
                        ),
                        // The mapping token is the region base.
                        None => handle.proxy().send_memory_map(r.addr, len, r.addr),
                    }
                    debug!(addr = r.addr, len, "exposed region to ADO");
                    offset += len;
                }
            }
            Err(s) => {
                error!(pool, %s, "cannot get pool regions; ADO unavailable for pool");
                self.ado.pool_map.remove(&pool);
                self.ado.by_name.remove(name);
            }
        }
    }

    /// Drop one pool-map reference; the last one returns lifetime locks and
    /// shuts the process down when only the name map still holds it.
    pub(crate) fn release_ado_reference(&mut self, pool: PoolId) -> Result<(), FatalError> {
        let Some(entry) = self.ado.pool_map.get_mut(&pool) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }
        let entry = self.ado.pool_map.remove(&pool).expect("entry just seen");
        debug!(pool, handles = entry.handle.ref_count(), "ADO pool reference released");

        // Two remaining handles means this entry plus the name map: no other
        // pool or pin still uses the process.
        if entry.handle.ref_count() == 2 {
            let (name, proxy_pool) = {
                let p = entry.handle.proxy();
                (p.pool_name().to_string(), p.pool_id())
            };
            let life = entry.handle.proxy().take_life_unlocks();
            for lock in life {
                if let Err(s) = self.backend.unlock(proxy_pool, lock, false) {
                    warn!(pool = proxy_pool, %s, "lifetime unlock at ADO release");
                }
            }
            entry.handle.shutdown_once();
            self.ado.by_name.remove(&name);
        }
        Ok(())
    }

    // === Client request paths ===

    pub(crate) fn process_ado_request(
        &mut self,
        sess: &mut Session,
        msg: &AdoRequest,
    ) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;

        if !self.ado_enabled() {
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!NOT_ENABLED");
            return Ok(());
        }
        if msg.flags.contains(AdoFlags::DETACHED) {
            // Detached delivery only makes sense with a value to deliver.
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!INVALID_ARGS");
            return Ok(());
        }

        if msg.flags.contains(AdoFlags::CREATE_ONLY) {
            return self.ado_create_only(sess, buf, msg);
        }

        let Some(entry) = self.ado.pool_map.get(&msg.pool_id) else {
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!NOT_RUNNING");
            return Ok(());
        };
        let handle = entry.handle.clone();

        let mut lock_handle = None;
        let mut value_addr = 0;
        let mut value_len = 0;
        let mut new_root = false;
        let lock_kind = if msg.flags.contains(AdoFlags::READ_ONLY) {
            LockKind::Read
        } else {
            LockKind::Write
        };

        if !msg.key.is_empty() {
            match self
                .backend
                .lock(msg.pool_id, &msg.key, lock_kind, msg.ondemand_val_len)
            {
                Ok(g) => {
                    lock_handle = Some(g.handle);
                    value_addr = g.addr;
                    value_len = g.len;
                    new_root = g.created;
                }
                Err(s) => {
                    debug!(%s, "ado request: key already locked");
                    error_response(
                        sess,
                        buf,
                        msg.request_id,
                        Status::Locked,
                        &format!("ADO!ALREADY_LOCKED({})", String::from_utf8_lossy(&msg.key)),
                    );
                    return Ok(());
                }
            }
        }

        let work_id = self.work.insert(WorkRecord {
            session: sess.token,
            pool: msg.pool_id,
            lock_handle,
            key: msg.key.clone(),
            lock_kind,
            request_id: msg.request_id,
            flags: msg.flags,
        });

        // The response is produced when the completion is observed; the
        // reserved buffer goes back to the pool.
        drop(buf);

        handle.proxy().send_work_request(WorkRequest {
            work_id,
            key: msg.key.clone(),
            value_addr,
            value_len,
            detached_addr: 0,
            detached_len: 0,
            request: msg.request.clone(),
            new_root,
        });
        self.stats.op_ado_count += 1;
        debug!(work_id, "ado work request sent");
        Ok(())
    }

    /// `ADO_FLAG_CREATE_ONLY`: materialize a zeroed value and return its
    /// address without involving the ADO.
    fn ado_create_only(
        &mut self,
        sess: &mut Session,
        buf: fabric::SendBuf,
        msg: &AdoRequest,
    ) -> Result<(), DispatchError> {
        let exists = !matches!(
            self.backend
                .get_attribute(msg.pool_id, Attribute::ValueLen, Some(&msg.key)),
            Err(Status::KeyNotFound)
        );
        if exists {
            error_response(
                sess,
                buf,
                msg.request_id,
                Status::AlreadyExists,
                "ADO!ALREADY_EXISTS",
            );
            return Ok(());
        }

        let lock_kind = if msg.flags.contains(AdoFlags::READ_ONLY) {
            LockKind::Read
        } else {
            LockKind::Write
        };
        let grant = match self
            .backend
            .lock(msg.pool_id, &msg.key, lock_kind, msg.ondemand_val_len)
        {
            Ok(g) => g,
            Err(_) => {
                error_response(
                    sess,
                    buf,
                    msg.request_id,
                    Status::Locked,
                    &format!("ADO!ALREADY_LOCKED({})", String::from_utf8_lossy(&msg.key)),
                );
                return Ok(());
            }
        };

        // Persistent memset of the fresh value.
        unsafe { std::ptr::write_bytes(grant.addr as *mut u8, 0, grant.len as usize) };
        let _ = self
            .backend
            .flush_pool_memory(msg.pool_id, grant.addr, grant.len);

        if self.backend.unlock(msg.pool_id, grant.handle, true).is_err() {
            return Err(FatalError::new("unable to unlock after create-only lock").into());
        }

        let mut resp = AdoResponse::new(Status::Ok, msg.request_id);
        resp.append(0, grant.addr.to_le_bytes().to_vec());
        sess.channel.post_response(buf, resp.encode());
        Ok(())
    }

    pub(crate) fn process_put_ado_request(
        &mut self,
        sess: &mut Session,
        msg: &PutAdoRequest,
    ) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;

        if !self.ado_enabled() {
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!NOT_ENABLED(put)");
            return Ok(());
        }
        let Some(entry) = self.ado.pool_map.get(&msg.pool_id) else {
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!NOT_RUNNING");
            return Ok(());
        };
        let handle = entry.handle.clone();
        if msg.value.is_empty() {
            error_response(sess, buf, msg.request_id, Status::Inval, "ADO!ZERO_VALUE_LEN");
            return Ok(());
        }

        let probe_exists = msg
            .flags
            .intersects(AdoFlags::NO_OVERWRITE | AdoFlags::DETACHED);
        let value_already_exists = probe_exists
            && !matches!(
                self.backend
                    .get_attribute(msg.pool_id, Attribute::ValueLen, Some(&msg.key)),
                Err(Status::KeyNotFound)
            );

        let mut lock_handle = None;
        let mut value_addr = 0;
        let mut value_len = 0;
        let mut new_root = false;

        // Detached put with a root value: create and hold the root now.
        if msg.flags.contains(AdoFlags::DETACHED) && msg.root_val_len > 0 {
            match self
                .backend
                .lock(msg.pool_id, &msg.key, LockKind::Write, msg.root_val_len)
            {
                Ok(g) => {
                    lock_handle = Some(g.handle);
                    value_addr = g.addr;
                    value_len = g.len;
                    new_root = g.created;
                }
                Err(_) => {
                    error_response(
                        sess,
                        buf,
                        msg.request_id,
                        Status::Locked,
                        "ADO!ALREADY_LOCKED",
                    );
                    return Ok(());
                }
            }
        }

        let mut detached_addr = 0;
        let mut detached_len = 0;
        if msg.flags.contains(AdoFlags::DETACHED) {
            let size = round_up(msg.value.len() as u64, 8);
            match self.backend.allocate_pool_memory(msg.pool_id, size, 8) {
                Ok(addr) => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            msg.value.as_ptr(),
                            addr as *mut u8,
                            msg.value.len(),
                        );
                    }
                    detached_addr = addr;
                    detached_len = size;
                    debug!(addr, len = size, "allocated detached value");
                }
                Err(s) => {
                    warn!(%s, len = size, "detached value allocation failed");
                    if let Some(h) = lock_handle {
                        let _ = self.backend.unlock(msg.pool_id, h, false);
                    }
                    error_response(sess, buf, msg.request_id, s, "ADO!OUT_OF_MEMORY");
                    return Ok(());
                }
            }
        } else if value_already_exists && msg.flags.contains(AdoFlags::NO_OVERWRITE) {
            // Keep the stored value.
        } else if let Err(s) = self
            .backend
            .put(msg.pool_id, &msg.key, &msg.value, StoreFlags::empty())
        {
            warn!(%s, "put-ado inline put failed");
            error_response(sess, buf, msg.request_id, s, "ADO!PUT_FAILED");
            return Ok(());
        }

        // Lock the pair unless the root creation already did.
        if lock_handle.is_none() {
            match self.backend.lock(msg.pool_id, &msg.key, LockKind::Write, 0) {
                Ok(g) => {
                    lock_handle = Some(g.handle);
                    value_addr = g.addr;
                    value_len = g.len;
                }
                Err(_) => {
                    if detached_len > 0 {
                        let _ =
                            self.backend
                                .free_pool_memory(msg.pool_id, detached_addr, detached_len);
                    }
                    error_response(
                        sess,
                        buf,
                        msg.request_id,
                        Status::Locked,
                        &format!("ADO!ALREADY_LOCKED({})", String::from_utf8_lossy(&msg.key)),
                    );
                    return Ok(());
                }
            }
        }

        let work_id = self.work.insert(WorkRecord {
            session: sess.token,
            pool: msg.pool_id,
            lock_handle,
            key: msg.key.clone(),
            lock_kind: LockKind::Write,
            request_id: msg.request_id,
            flags: msg.flags,
        });

        drop(buf);

        handle.proxy().send_work_request(WorkRequest {
            work_id,
            key: msg.key.clone(),
            value_addr,
            value_len,
            detached_addr,
            detached_len,
            request: msg.request.clone(),
            new_root,
        });
        self.stats.op_ado_count += 1;
        debug!(work_id, "put-ado work request sent");
        Ok(())
    }

    // === Completion and callback drain ===

    pub(crate) fn process_messages_from_ado(
        &mut self,
        sessions: &mut [Session],
    ) -> Result<(), DispatchError> {
        let pools: Vec<PoolId> = self.ado.pool_map.keys().copied().collect();
        for pool in pools {
            let handle = match self.ado.pool_map.get(&pool) {
                Some(e) => e.handle.clone(),
                None => continue,
            };

            loop {
                let completion = handle.proxy().check_work_completions();
                let Some(completion) = completion else { break };
                self.handle_work_completion(sessions, &handle, completion)?;
            }

            loop {
                let callback = handle.proxy().recv_callback();
                let Some(callback) = callback else { break };
                self.handle_ado_callback(sessions, pool, &handle, callback)?;
            }
        }
        Ok(())
    }

    fn handle_work_completion(
        &mut self,
        sessions: &mut [Session],
        handle: &AdoHandle,
        completion: WorkCompletion,
    ) -> Result<(), DispatchError> {
        let mut status = Status::clamp_ado(completion.status);
        debug!(work_id = completion.work_id, %status, "ado work completion");

        let Some(record) = self.work.remove(completion.work_id) else {
            return Err(FatalError::new(format!(
                "bad work request key from ADO ({:#x})",
                completion.work_id
            ))
            .into());
        };

        if let Some(lock) = record.lock_handle {
            self.backend
                .unlock(record.pool, lock, false)
                .map_err(|s| FatalError::new(format!("unlock after ADO completion: {s}")))?;
        }

        for lock in handle.proxy().take_deferred_unlocks(completion.work_id) {
            self.backend
                .unlock(record.pool, lock, false)
                .map_err(|s| FatalError::new(format!("deferred unlock failed: {s}")))?;
        }

        if status == Status::EraseTarget {
            status = match self.backend.erase(record.pool, &record.key) {
                Ok(()) => {
                    self.remove_index_key(record.pool, &record.key);
                    Status::Ok
                }
                Err(s) => {
                    warn!(%s, "ADO-requested target erase failed");
                    s
                }
            };
        }

        if record.is_async() {
            if status.is_err() {
                debug!(%status, "parking failed async request");
                self.park_failed_async(record.clone(), status);
            }
        } else if let Some(sess) = find_session_mut(sessions, record.session) {
            if sess.channel.client_connected() {
                match sess.channel.allocate_send() {
                    Ok(buf) => {
                        let mut resp = AdoResponse::new(status, record.request_id);
                        for rb in &completion.buffers {
                            let bytes = match &rb.source {
                                BufferSource::Inline(b) => b.clone(),
                                BufferSource::Pool { addr, len, .. } => unsafe {
                                    std::slice::from_raw_parts(*addr as *const u8, *len as usize)
                                        .to_vec()
                                },
                            };
                            resp.append(rb.layer_id, bytes);
                        }
                        sess.channel.post_response(buf, resp.encode());
                    }
                    Err(e) => {
                        // The completion is already consumed; the response
                        // cannot be retried.
                        warn!(%e, "no send buffer for ADO response, dropping");
                    }
                }
            }
        }

        for rb in &completion.buffers {
            if let BufferSource::Pool {
                addr,
                len,
                free: true,
            } = rb.source
            {
                if let Err(s) = self.backend.free_pool_memory(record.pool, addr, len) {
                    warn!(%s, "free of ADO response buffer failed");
                }
            }
        }
        Ok(())
    }

    fn handle_ado_callback(
        &mut self,
        sessions: &mut [Session],
        pool: PoolId,
        handle: &AdoHandle,
        callback: AdoCallback,
    ) -> Result<(), DispatchError> {
        match callback {
            AdoCallback::TableOp {
                work_id,
                op,
                key,
                value_len,
                align_or_flags,
                addr,
            } => self.ado_table_op(pool, handle, work_id, op, key, value_len, align_or_flags, addr),
            AdoCallback::PoolInfo => self.ado_pool_info(sessions, pool, handle),
            AdoCallback::OpEventResponse(op) => self.ado_op_event_response(pool, handle, op),
            AdoCallback::Iterate { bounds, iterator } => {
                self.ado_iterate(pool, handle, bounds, iterator)
            }
            AdoCallback::Vector { bounds } => self.ado_vector(pool, handle, bounds),
            AdoCallback::IndexFind {
                expr,
                begin,
                find_type,
                max_comparisons,
            } => {
                self.ado_index_find(pool, handle, &expr, begin, find_type, max_comparisons);
                Ok(())
            }
            AdoCallback::Unlock { work_id, handle: lock } => {
                // Refused when the lock carries an implicit unlock; only
                // FLAGS_NO_IMPLICIT_UNLOCK locks may be returned this way.
                let status = if handle.proxy().has_implicit_unlock(work_id, lock) {
                    Status::Inval
                } else {
                    match self.backend.unlock(pool, lock, false) {
                        Ok(()) => Status::Ok,
                        Err(s) => s,
                    }
                };
                handle.proxy().send_unlock_response(status);
                Ok(())
            }
            AdoCallback::Configure { options } => {
                if options & configure_options::SHARD_INC_REF != 0 {
                    self.ado.pins.push(handle.clone());
                }
                if options & configure_options::SHARD_DEC_REF != 0 {
                    if let Some(i) = self.ado.pins.iter().position(|h| h.same(handle)) {
                        self.ado.pins.remove(i);
                    }
                }
                handle.proxy().send_configure_response(Status::Ok);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ado_table_op(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        work_id: u64,
        op: TableOp,
        key: Vec<u8>,
        value_len: u64,
        align_or_flags: u64,
        addr: u64,
    ) -> Result<(), DispatchError> {
        match op {
            TableOp::Create | TableOp::Open => {
                if op == TableOp::Create {
                    let exists = !matches!(
                        self.backend.get_attribute(pool, Attribute::ValueLen, Some(&key)),
                        Err(Status::KeyNotFound)
                    );
                    if exists && align_or_flags & table_op_flags::CREATE_ONLY != 0 {
                        handle.proxy().send_table_op_response(
                            Status::AlreadyExists,
                            0,
                            0,
                            None,
                        );
                        return Ok(());
                    }
                }

                let grant = match self.backend.lock(pool, &key, LockKind::Write, value_len) {
                    Ok(g) => g,
                    Err(s) => {
                        debug!(%s, key = %String::from_utf8_lossy(&key), "table op lock failed");
                        handle.proxy().send_table_op_response(s, 0, 0, None);
                        return Ok(());
                    }
                };
                self.add_index_key(pool, &key);

                if align_or_flags & table_op_flags::NO_IMPLICIT_UNLOCK != 0 {
                    debug!(key = %String::from_utf8_lossy(&key), "locked without implicit unlock");
                } else if align_or_flags & table_op_flags::ADO_LIFETIME_UNLOCK != 0 {
                    handle.proxy().add_life_unlock(grant.handle);
                } else {
                    // Default policy: unlock when the owning invocation
                    // completes.
                    if work_id == 0 {
                        handle.proxy().send_table_op_response(Status::Inval, 0, 0, None);
                        return Ok(());
                    }
                    let deferred = handle.proxy().add_deferred_unlock(work_id, grant.handle);
                    if let Err(s) = deferred {
                        warn!(%s, "too many deferred locks");
                        handle.proxy().send_table_op_response(s, 0, 0, None);
                        return Ok(());
                    }
                }

                handle.proxy().send_table_op_response(
                    Status::Ok,
                    grant.addr,
                    grant.len,
                    Some(grant.handle),
                );
                Ok(())
            }
            TableOp::Erase => {
                let status = match self.backend.erase(pool, &key) {
                    Ok(()) => {
                        self.remove_index_key(pool, &key);
                        Status::Ok
                    }
                    Err(s) => s,
                };
                handle.proxy().send_table_op_response(status, 0, 0, None);
                Ok(())
            }
            TableOp::ValueResize => self.ado_value_resize(pool, handle, work_id, key, value_len, align_or_flags),
            TableOp::AllocatePoolMemory => {
                let (status, out_addr) =
                    match self.backend.allocate_pool_memory(pool, value_len, align_or_flags) {
                        Ok(a) => (Status::Ok, a),
                        Err(s) => (s, 0),
                    };
                debug!(len = value_len, addr = out_addr, %status, "ado pool memory allocation");
                handle.proxy().send_table_op_response(status, out_addr, value_len, None);
                Ok(())
            }
            TableOp::FreePoolMemory => {
                if value_len == 0 {
                    handle.proxy().send_table_op_response(Status::Inval, 0, 0, None);
                    return Ok(());
                }
                let status = match self.backend.free_pool_memory(pool, addr, value_len) {
                    Ok(()) => Status::Ok,
                    Err(s) => {
                        warn!(%s, "ado pool memory free failed");
                        s
                    }
                };
                handle.proxy().send_table_op_response(status, 0, 0, None);
                Ok(())
            }
        }
    }

    /// Resize the current invocation target: unlock, resize, relock, then
    /// fix up whichever unlock bookkeeping tracked the old handle.
    fn ado_value_resize(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        work_id: u64,
        key: Vec<u8>,
        new_len: u64,
        align: u64,
    ) -> Result<(), DispatchError> {
        let Some(record) = self.work.get(work_id) else {
            handle.proxy().send_table_op_response(Status::Inval, 0, 0, None);
            return Ok(());
        };
        if record.key != key {
            handle.proxy().send_table_op_response(Status::Inval, 0, 0, None);
            return Ok(());
        }
        let Some(old_handle) = record.lock_handle else {
            handle.proxy().send_table_op_response(Status::Inval, 0, 0, None);
            return Ok(());
        };

        if let Err(s) = self.backend.unlock(pool, old_handle, false) {
            handle.proxy().send_table_op_response(s, 0, 0, None);
            return Ok(());
        }

        let resize_status = match self.backend.resize_value(pool, &key, new_len, align) {
            Ok(()) => Status::Ok,
            Err(s) => s,
        };

        let grant = self
            .backend
            .lock(pool, &key, LockKind::Write, 0)
            .map_err(|s| FatalError::new(format!("resize failed to relock: {s}")))?;

        if let Some(record) = self.work.get_mut(work_id) {
            record.lock_handle = Some(grant.handle);
        }

        let deferred_updated = handle
            .proxy()
            .update_deferred_unlock(work_id, grant.handle)
            .is_ok();
        if !deferred_updated {
            let was_life_lock = handle.proxy().remove_life_unlock(old_handle).is_ok();
            if was_life_lock {
                handle.proxy().add_life_unlock(grant.handle);
            }
        }

        handle.proxy().send_table_op_response(
            resize_status,
            grant.addr,
            grant.len,
            Some(grant.handle),
        );
        Ok(())
    }

    fn ado_pool_info(
        &mut self,
        sessions: &mut [Session],
        pool: PoolId,
        handle: &AdoHandle,
    ) -> Result<(), DispatchError> {
        let owning_session = self.ado.pool_map.get(&pool).map(|e| e.session);
        let (expected_count, size, flags) = owning_session
            .and_then(|token| find_session_mut(sessions, token))
            .and_then(|s| s.pools.pool_info(pool))
            .unwrap_or((0, 0, 0));

        let memory_type = self
            .backend
            .get_attribute(pool, Attribute::MemoryType, None)
            .map_err(|s| FatalError::new(format!("MEMORY_TYPE attribute failed: {s}")))?;

        let mut doc = serde_json::json!({
            "pool_size": size,
            "memory_type": memory_type,
            "expected_obj_count": expected_count,
            "pool_flags": flags,
        });
        if let Ok(pu) = self.backend.get_attribute(pool, Attribute::PercentUsed, None) {
            doc["percent_used"] = pu.into();
        }
        if let Ok(count) = self.backend.get_attribute(pool, Attribute::Count, None) {
            doc["current_object_count"] = count.into();
        }

        handle.proxy().send_pool_info_response(Status::Ok, doc.to_string());
        Ok(())
    }

    fn ado_op_event_response(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        op: OpEvent,
    ) -> Result<(), DispatchError> {
        match op {
            OpEvent::PoolDelete => {
                // Finish the close+delete that the pool DELETE request
                // queued behind this op event.
                let name = {
                    let p = handle.proxy();
                    p.pool_name().to_string()
                };
                if self.backend.close_pool(pool).is_err()
                    || self.backend.delete_pool(&name).is_err()
                {
                    return Err(FatalError::new(
                        "unable to delete pool after POOL DELETE op event",
                    )
                    .into());
                }
                debug!(pool, "POOL DELETE op event completed");
                Ok(())
            }
            OpEvent::Close => {
                warn!("ignoring CLOSE op event from ADO");
                Ok(())
            }
        }
    }

    fn ado_iterate(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        bounds: kvapi::TimeRange,
        iterator: Option<kvapi::IterHandle>,
    ) -> Result<(), DispatchError> {
        let it = match iterator {
            Some(it) => it,
            None => match self.backend.open_pool_iterator(pool) {
                Ok(it) => it,
                Err(_) => {
                    handle.proxy().send_iterate_response(Status::NotImpl, None, None);
                    return Ok(());
                }
            },
        };

        loop {
            match self.backend.deref_pool_iterator(pool, it, bounds) {
                Ok(entry) if entry.time_match => {
                    handle.proxy().send_iterate_response(Status::Ok, Some(it), Some(entry));
                    return Ok(());
                }
                Ok(_) => continue,
                Err(Status::OutOfBounds) => {
                    let _ = self.backend.close_pool_iterator(pool, it);
                    handle
                        .proxy()
                        .send_iterate_response(Status::OutOfBounds, Some(it), None);
                    return Ok(());
                }
                Err(s) => {
                    warn!(%s, "pool iterator deref failed");
                    handle.proxy().send_iterate_response(s, Some(it), None);
                    return Ok(());
                }
            }
        }
    }

    /// Materialize a `(key, key_len, value, value_len)` reference vector in
    /// pool memory.
    fn ado_vector(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        bounds: kvapi::TimeRange,
    ) -> Result<(), DispatchError> {
        let count = if bounds.is_bounded() {
            match self.backend.map(pool, &mut |_, _, _, _| {}, bounds) {
                Ok(n) => n,
                Err(s) => {
                    handle.proxy().send_vector_response(s, ReferenceVector::default());
                    return Ok(());
                }
            }
        } else {
            match self.backend.count(pool) {
                Ok(n) => n,
                Err(s) => {
                    handle.proxy().send_vector_response(s, ReferenceVector::default());
                    return Ok(());
                }
            }
        };

        let buffer_len = ReferenceVector::size_required(count);
        let buffer = match self.backend.allocate_pool_memory(pool, buffer_len, 8) {
            Ok(a) => a,
            Err(s) => {
                handle.proxy().send_vector_response(s, ReferenceVector::default());
                return Ok(());
            }
        };

        // Layout: record count, then (key, key_len, value, value_len) quads.
        let mut cursor = buffer + 16;
        let mut written = 0u64;
        let map_status = self.backend.map(
            pool,
            &mut |key, value_addr, value_len, _ts| {
                if written >= count {
                    return;
                }
                unsafe {
                    let p = cursor as *mut u64;
                    p.write_unaligned(key.as_ptr() as u64);
                    p.add(1).write_unaligned(key.len() as u64);
                    p.add(2).write_unaligned(value_addr);
                    p.add(3).write_unaligned(value_len);
                }
                cursor += 32;
                written += 1;
            },
            bounds,
        );
        unsafe { (buffer as *mut u64).write_unaligned(written) };

        let status = match map_status {
            Ok(_) => Status::Ok,
            Err(s) => s,
        };
        handle.proxy().send_vector_response(
            status,
            ReferenceVector {
                count: written,
                addr: buffer,
                len: buffer_len,
            },
        );
        Ok(())
    }

    fn ado_index_find(
        &mut self,
        pool: PoolId,
        handle: &AdoHandle,
        expr: &str,
        begin: u64,
        find_type: u32,
        max_comparisons: u64,
    ) {
        let Some(index) = self.index_map.get(&pool) else {
            warn!(pool, "ADO index operation without an index");
            handle
                .proxy()
                .send_find_index_response(Status::NoIndex, 0, b"noindex");
            return;
        };
        let Some(find_type) = FindType::from_u32(find_type) else {
            handle.proxy().send_find_index_response(Status::Inval, 0, b"");
            return;
        };
        match index.find(expr, begin, find_type, max_comparisons) {
            Ok((position, key)) => {
                handle.proxy().send_find_index_response(Status::Ok, position, &key);
            }
            Err(s) => {
                handle.proxy().send_find_index_response(s, 0, b"");
            }
        }
    }
}
