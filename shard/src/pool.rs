//! Per-session open-pool bookkeeping and pool request handling.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use kvapi::{PoolId, Status, StoreFlags};
use kvwire::{PoolOp, PoolRequest, PoolResponse};

use crate::dispatch::DispatchError;
use crate::shard::{Core, Session};

#[derive(Debug, Clone)]
struct OpenPool {
    name: String,
    refcount: u32,
    expected_count: u64,
    size: u64,
    flags: u32,
}

/// Tracks which pools one session has open, with per-pool reference counts.
/// Multiple sessions opening the same pool each hold their own manager
/// entry over the one shared backend handle.
#[derive(Default)]
pub struct PoolManager {
    pools: HashMap<PoolId, OpenPool>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        pool: PoolId,
        expected_count: u64,
        size: u64,
        flags: u32,
    ) {
        self.pools.insert(
            pool,
            OpenPool {
                name: name.to_string(),
                refcount: 1,
                expected_count,
                size,
                flags,
            },
        );
    }

    /// Pool id this session already has open under `name`, if any.
    pub fn find_by_name(&self, name: &str) -> Option<PoolId> {
        self.pools
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(&id, _)| id)
    }

    pub fn add_reference(&mut self, pool: PoolId) {
        if let Some(p) = self.pools.get_mut(&pool) {
            p.refcount += 1;
        }
    }

    /// Drop one reference. Returns true when the count reached zero and the
    /// entry was removed.
    pub fn release(&mut self, pool: PoolId) -> bool {
        match self.pools.get_mut(&pool) {
            Some(p) if p.refcount > 1 => {
                p.refcount -= 1;
                false
            }
            Some(_) => {
                self.pools.remove(&pool);
                true
            }
            None => false,
        }
    }

    pub fn reference_count(&self, pool: PoolId) -> u32 {
        self.pools.get(&pool).map(|p| p.refcount).unwrap_or(0)
    }

    pub fn is_open(&self, pool: PoolId) -> bool {
        self.pools.contains_key(&pool)
    }

    pub fn pool_name(&self, pool: PoolId) -> Option<&str> {
        self.pools.get(&pool).map(|p| p.name.as_str())
    }

    /// `(expected_count, size, flags)` recorded at open.
    pub fn pool_info(&self, pool: PoolId) -> Option<(u64, u64, u32)> {
        self.pools
            .get(&pool)
            .map(|p| (p.expected_count, p.size, p.flags))
    }

    /// Pool ids currently open in this session.
    pub fn open_pool_set(&self) -> Vec<PoolId> {
        self.pools.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Core {
    pub(crate) fn process_pool_request(
        &mut self,
        sess: &mut Session,
        msg: &PoolRequest,
    ) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let flags = StoreFlags::from_bits_truncate(msg.flags);
        let mut resp = PoolResponse {
            status: Status::Ok,
            pool_id: 0,
        };

        match msg.op {
            PoolOp::Create => {
                debug!(name = %msg.name, size = msg.size, count = msg.expected_count, "pool create");
                if let Some(pool) = sess.pools.find_by_name(&msg.name) {
                    if flags.contains(StoreFlags::CREATE_ONLY) {
                        warn!(name = %msg.name, "create denied, create-only on open pool");
                        resp.status = Status::Fail;
                    } else {
                        sess.pools.add_reference(pool);
                        resp.pool_id = pool;
                    }
                } else {
                    match self
                        .backend
                        .create_pool(&msg.name, msg.size, flags, msg.expected_count)
                    {
                        Ok(pool) => {
                            sess.pools.register(
                                &msg.name,
                                pool,
                                msg.expected_count,
                                msg.size,
                                msg.flags,
                            );
                            resp.pool_id = pool;
                            self.preregister_pool_regions(sess, pool);
                        }
                        Err(s) => {
                            warn!(name = %msg.name, %s, "unable to create pool");
                            resp.status = s;
                        }
                    }
                }
                if resp.status.is_ok() && resp.pool_id != 0 && self.ado_enabled() {
                    self.conditional_bootstrap_ado(
                        sess,
                        resp.pool_id,
                        &msg.name,
                        msg.size,
                        flags,
                        msg.expected_count,
                        false,
                    );
                }
            }
            PoolOp::Open => {
                debug!(name = %msg.name, "pool open");
                if let Some(pool) = sess.pools.find_by_name(&msg.name) {
                    debug!(pool, "reusing existing open pool");
                    sess.pools.add_reference(pool);
                    resp.pool_id = pool;
                } else {
                    match self.backend.open_pool(&msg.name) {
                        Ok(pool) => {
                            sess.pools.register(&msg.name, pool, 0, 0, msg.flags);
                            resp.pool_id = pool;
                        }
                        Err(_) => {
                            resp.status = Status::Inval;
                        }
                    }
                }
                if resp.status.is_ok() && resp.pool_id != 0 && self.ado_enabled() {
                    self.conditional_bootstrap_ado(
                        sess,
                        resp.pool_id,
                        &msg.name,
                        msg.size,
                        flags,
                        msg.expected_count,
                        true,
                    );
                }
            }
            PoolOp::Close => {
                debug!(pool = msg.pool_id, "pool close");
                if !sess.pools.is_open(msg.pool_id) {
                    resp.status = Status::Inval;
                } else if sess.pools.release(msg.pool_id) {
                    debug!(pool = msg.pool_id, "session pool reference now zero");
                    if self.ado_enabled() {
                        if let Err(e) = self.release_ado_reference(msg.pool_id) {
                            return Err(e.into());
                        }
                    }
                    resp.status = match self.backend.close_pool(msg.pool_id) {
                        Ok(()) => Status::Ok,
                        Err(s) => {
                            warn!(pool = msg.pool_id, %s, "close_pool");
                            s
                        }
                    };
                }
            }
            PoolOp::Delete => {
                info!(pool = msg.pool_id, name = %msg.name, "pool delete");
                if msg.pool_id != 0 && sess.pools.is_open(msg.pool_id) {
                    if sess.pools.reference_count(msg.pool_id) == 1 {
                        let pool_name = sess
                            .pools
                            .pool_name(msg.pool_id)
                            .unwrap_or_default()
                            .to_string();
                        if !sess.pools.release(msg.pool_id) {
                            return Err(crate::dispatch::FatalError::new(
                                "unexpected pool reference count",
                            )
                            .into());
                        }
                        let proxy = self
                            .ado
                            .pool_map
                            .get(&msg.pool_id)
                            .map(|e| e.handle.clone());
                        match proxy {
                            Some(handle) if self.ado_enabled() => {
                                // The close+delete completes when the ADO
                                // answers the op event; the shard must not
                                // block here.
                                handle.proxy().send_op_event(adoproto::OpEvent::PoolDelete);
                            }
                            _ => {
                                if let Err(s) = self.backend.close_pool(msg.pool_id) {
                                    warn!(pool = msg.pool_id, %s, "close before delete");
                                }
                                resp.status = match self.backend.delete_pool(&pool_name) {
                                    Ok(()) => Status::Ok,
                                    Err(s) => {
                                        warn!(name = %pool_name, %s, "pool delete failed");
                                        s
                                    }
                                };
                            }
                        }
                    } else {
                        resp.status = Status::Busy;
                    }
                } else if sess.pools.find_by_name(&msg.name).is_some() {
                    debug!(name = %msg.name, "delete on pool that is still open");
                    resp.status = Status::AlreadyOpen;
                } else {
                    resp.status = match self.backend.delete_pool(&msg.name) {
                        Ok(()) => Status::Ok,
                        Err(s) => s,
                    };
                }
            }
        }

        sess.channel.post_response(buf, resp.encode());
        Ok(())
    }

    /// Hint the fabric about a pool's region layout so direct transfers hit
    /// pre-registered memory.
    fn preregister_pool_regions(&mut self, sess: &mut Session, pool: PoolId) {
        match self.backend.pool_regions(pool) {
            Ok((_, regions)) => {
                for r in regions {
                    debug!(addr = r.addr, len = r.len, "pre-registering region");
                    sess.channel.ondemand_register(r.addr, r.len);
                }
            }
            Err(_) => {
                info!("pool region query not supported, using on-demand registration");
            }
        }
    }
}
