//! Shard state and the per-CPU event loop.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use adoproto::AdoManager;
use fabric::{Channel, Listener, Tick, ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE};
use kvapi::{KvIndex, KvStore, PoolId};
use kvwire::{MsgType, ShardStats};

use crate::ado::{AdoHandle, AdoPoolEntry};
use crate::cluster::ClusterSignalQueue;
use crate::config::ShardConfig;
use crate::dispatch::{DispatchError, FatalError};
use crate::index::VolatileTreeIndex;
use crate::pool::PoolManager;
use crate::tasks::Task;
use crate::trackers::{LockedValueMap, PendingRenameMap, SpaceMap};
use crate::work::{WorkRecord, WorkTable};

const CHECK_CONNECTION_INTERVAL: u64 = 1000;
const CHECK_CLUSTER_SIGNAL_INTERVAL: u64 = 10_000;
const SESSIONS_EMPTY_SLEEP: Duration = Duration::from_millis(50);

/// Cap on parked failed asynchronous ADO requests.
const FAILED_ASYNC_CAP: usize = 1024;

/// One client session: fabric channel plus per-session pool references.
pub(crate) struct Session {
    pub token: u64,
    pub channel: Box<dyn Channel>,
    pub pools: PoolManager,
    pub closing: bool,
}

/// ADO bookkeeping: proxies by pool name, the per-pool entry with its owning
/// session, and handles pinned by ADO configure requests.
#[derive(Default)]
pub(crate) struct AdoState {
    pub manager: Option<Box<dyn AdoManager>>,
    pub by_name: HashMap<String, AdoHandle>,
    pub pool_map: HashMap<PoolId, AdoPoolEntry>,
    pub pins: Vec<AdoHandle>,
}

/// A parked failed asynchronous request.
pub(crate) struct FailedAsync {
    pub record: WorkRecord,
    pub status: kvapi::Status,
}

/// Everything the dispatch paths touch, separated from the session list so
/// a session and the core can be borrowed together.
pub(crate) struct Core {
    pub backend: Box<dyn KvStore>,
    pub locked_shared: LockedValueMap,
    pub locked_exclusive: LockedValueMap,
    pub spaces: SpaceMap,
    pub renames: PendingRenameMap,
    pub work: WorkTable,
    pub tasks: Vec<Box<dyn Task>>,
    pub failed_async: VecDeque<FailedAsync>,
    pub index_map: HashMap<PoolId, VolatileTreeIndex>,
    pub ado: AdoState,
    pub stats: ShardStats,
    pub config: ShardConfig,
}

pub(crate) fn find_session_mut<'a>(
    sessions: &'a mut [Session],
    token: u64,
) -> Option<&'a mut Session> {
    sessions.iter_mut().find(|s| s.token == token)
}

impl Core {
    pub fn ado_enabled(&self) -> bool {
        self.ado.manager.is_some()
    }

    /// Route one protocol frame to its handler.
    pub fn dispatch(&mut self, sess: &mut Session, frame: &[u8]) -> Result<(), DispatchError> {
        let msg_type = kvwire::peek_type(frame)
            .map_err(|e| FatalError::new(format!("unrecognizable message: {e}")))?;
        match msg_type {
            MsgType::PoolRequest => {
                let msg = kvwire::PoolRequest::decode(frame)
                    .map_err(|e| FatalError::new(format!("pool request decode: {e}")))?;
                self.process_pool_request(sess, &msg)
            }
            MsgType::IoRequest => {
                let msg = kvwire::IoRequest::decode(frame)
                    .map_err(|e| FatalError::new(format!("io request decode: {e}")))?;
                self.stats.op_request_count += 1;
                self.process_io_request(sess, &msg)
            }
            MsgType::InfoRequest => {
                let msg = kvwire::InfoRequest::decode(frame)
                    .map_err(|e| FatalError::new(format!("info request decode: {e}")))?;
                self.process_info_request(sess, &msg)
            }
            MsgType::AdoRequest => {
                let msg = kvwire::AdoRequest::decode(frame)
                    .map_err(|e| FatalError::new(format!("ado request decode: {e}")))?;
                self.process_ado_request(sess, &msg)
            }
            MsgType::PutAdoRequest => {
                let msg = kvwire::PutAdoRequest::decode(frame)
                    .map_err(|e| FatalError::new(format!("put-ado request decode: {e}")))?;
                self.process_put_ado_request(sess, &msg)
            }
            other => Err(FatalError::new(format!("unexpected message type {other:?}")).into()),
        }
    }

    /// Unlock an exclusively locked value identified by its address.
    pub fn release_locked_value_exclusive(&mut self, addr: u64) -> Result<(), FatalError> {
        if let Some((pool, handle)) = self.locked_exclusive.release(addr)? {
            self.backend
                .unlock(pool, handle, true)
                .map_err(|s| FatalError::new(format!("exclusive unlock failed: {s}")))?;
        }
        Ok(())
    }

    /// Unlock a shared locked value identified by its address.
    pub fn release_locked_value_shared(&mut self, addr: u64) -> Result<(), FatalError> {
        if let Some((pool, handle)) = self.locked_shared.release(addr)? {
            self.backend
                .unlock(pool, handle, false)
                .map_err(|s| FatalError::new(format!("shared unlock failed: {s}")))?;
        }
        Ok(())
    }

    /// Discharge the pending rename recorded for a released value: make the
    /// final key exist, swap the stored values, erase the temporary, index
    /// the final key. A missing record is not an error (shared releases).
    pub fn release_pending_rename(&mut self, addr: u64) -> Result<(), FatalError> {
        let Some(rename) = self.renames.take(addr) else {
            return Ok(());
        };
        debug!(
            from = %String::from_utf8_lossy(&rename.from),
            to = %String::from_utf8_lossy(&rename.to),
            "discharging pending rename"
        );
        // Lock/unlock first: creates the final key on demand.
        let grant = self
            .backend
            .lock(rename.pool, &rename.to, kvapi::LockKind::Write, 8)
            .map_err(|s| FatalError::new(format!("rename lock failed: {s}")))?;
        self.backend
            .unlock(rename.pool, grant.handle, false)
            .map_err(|s| FatalError::new(format!("rename unlock failed: {s}")))?;
        self.backend
            .swap_keys(rename.pool, &rename.from, &rename.to)
            .map_err(|s| FatalError::new(format!("rename swap_keys failed: {s}")))?;
        self.backend
            .erase(rename.pool, &rename.from)
            .map_err(|s| FatalError::new(format!("rename erase failed: {s}")))?;
        self.add_index_key(rename.pool, &rename.to);
        Ok(())
    }

    pub fn add_index_key(&mut self, pool: PoolId, key: &[u8]) {
        if let Some(index) = self.index_map.get_mut(&pool) {
            index.insert(key);
        }
    }

    pub fn remove_index_key(&mut self, pool: PoolId, key: &[u8]) {
        if let Some(index) = self.index_map.get_mut(&pool) {
            index.remove(key);
        }
    }

    pub fn park_failed_async(&mut self, record: WorkRecord, status: kvapi::Status) {
        if self.failed_async.len() >= FAILED_ASYNC_CAP {
            warn!("failed-async list full, dropping oldest");
            self.failed_async.pop_front();
        }
        self.failed_async.push_back(FailedAsync { record, status });
        self.stats.failed_async_count = self.failed_async.len() as u64;
    }

    /// Close one of a session's pools: drop the ADO reference, then the
    /// backend handle.
    pub fn release_session_pool(&mut self, pool: PoolId) -> Result<(), FatalError> {
        if self.ado_enabled() {
            self.release_ado_reference(pool)?;
        }
        if let Err(s) = self.backend.close_pool(pool) {
            warn!(pool, %s, "close_pool on session teardown");
        }
        Ok(())
    }
}

/// The per-CPU worker.
pub struct Shard {
    core: Core,
    sessions: Vec<Session>,
    listener: Box<dyn Listener>,
    cluster: ClusterSignalQueue,
    shutdown: Arc<AtomicBool>,
    exit: bool,
    tick: u64,
    next_session_token: u64,
}

impl Shard {
    pub fn new(
        config: ShardConfig,
        backend: Box<dyn KvStore>,
        listener: Box<dyn Listener>,
        ado_manager: Option<Box<dyn AdoManager>>,
        cluster: ClusterSignalQueue,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Shard {
            core: Core {
                backend,
                locked_shared: LockedValueMap::new(),
                locked_exclusive: LockedValueMap::new(),
                spaces: SpaceMap::new(),
                renames: PendingRenameMap::new(),
                work: WorkTable::new(),
                tasks: Vec::new(),
                failed_async: VecDeque::new(),
                index_map: HashMap::new(),
                ado: AdoState {
                    manager: ado_manager,
                    ..Default::default()
                },
                stats: ShardStats::default(),
                config,
            },
            sessions: Vec::new(),
            listener,
            cluster,
            shutdown,
            exit: false,
            tick: 0,
            next_session_token: 1,
        }
    }

    /// Run until SIGINT or forced exit. Pins the worker to its core.
    pub fn run(&mut self) {
        crate::affinity::pin_to_core(self.core.config.core);
        info!(core = self.core.config.core, "shard worker entered");
        while !self.exit {
            if self.sessions.is_empty() {
                std::thread::sleep(SESSIONS_EMPTY_SLEEP);
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                self.check_for_new_connections();
                self.service_cluster_signals();
                continue;
            }
            if let Err(e) = self.tick_once() {
                error!(%e, "shard terminating");
                break;
            }
        }
        self.close_all_ado();
        info!(core = self.core.config.core, "shard worker exited");
    }

    /// One iteration of the event loop.
    pub fn tick_once(&mut self) -> Result<(), FatalError> {
        if self.shutdown.load(Ordering::Relaxed) {
            info!("shard: received shutdown signal");
            self.exit = true;
        }

        if self.tick % CHECK_CONNECTION_INTERVAL == 0 {
            self.check_for_new_connections();
        }
        if self.tick % CHECK_CLUSTER_SIGNAL_INTERVAL == 0 {
            self.service_cluster_signals();
        }
        self.tick = self.tick.wrapping_add(1);

        self.core.stats.client_count = self.sessions.len() as u16;

        let mut pending_close = Vec::new();

        for i in 0..self.sessions.len() {
            let tick_response = self.sessions[i].channel.tick();

            if (tick_response == Tick::Close || self.exit) && !self.sessions[i].closing {
                self.sessions[i].closing = true;
                debug!(session = self.sessions[i].token, "closing session, forcing pool closures");
                for pool in self.sessions[i].pools.open_pool_set() {
                    self.core.release_session_pool(pool)?;
                }
                pending_close.push(i);
            }

            // Drain all deferred actions.
            while let Some(action) = self.sessions[i].channel.next_pending_action() {
                match action.op {
                    ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE => {
                        debug!(addr = action.arg, "releasing value lock");
                        self.core.release_locked_value_exclusive(action.arg)?;
                        self.core.release_pending_rename(action.arg)?;
                    }
                    other => {
                        return Err(FatalError::new(format!("unknown action type {other}")));
                    }
                }
            }

            // Take at most one pending message; keep it queued on transient
            // resource shortage.
            if !self.sessions[i].closing {
                let frame = self.sessions[i].channel.peek_pending_msg();
                if let Some(frame) = frame {
                    match self.core.dispatch(&mut self.sessions[i], &frame) {
                        Ok(()) => self.sessions[i].channel.pop_pending_msg(),
                        Err(DispatchError::Resource(e)) => {
                            debug!(%e, "short of buffers, retrying next tick");
                        }
                        Err(DispatchError::Fatal(e)) => return Err(e),
                    }
                }
            }
        }

        match self.core.process_messages_from_ado(&mut self.sessions) {
            Ok(()) => {}
            Err(DispatchError::Resource(e)) => {
                debug!(%e, "short of buffers, retrying next tick");
            }
            Err(DispatchError::Fatal(e)) => return Err(e),
        }
        self.core.process_tasks(&mut self.sessions);

        for i in pending_close.into_iter().rev() {
            let sess = self.sessions.remove(i);
            debug!(session = sess.token, remaining = self.sessions.len(), "session deleted");
        }
        if self.sessions.is_empty() && self.core.config.forced_exit {
            debug!("shard: forcing exit");
            self.exit = true;
        }
        Ok(())
    }

    pub fn check_for_new_connections(&mut self) {
        while let Some(channel) = self.listener.accept_one() {
            let token = self.next_session_token;
            self.next_session_token += 1;
            info!(session = token, total = self.sessions.len() + 1, "new connection");
            self.sessions.push(Session {
                token,
                channel,
                pools: PoolManager::new(),
                closing: false,
            });
        }
    }

    fn service_cluster_signals(&mut self) {
        if !self.core.config.cluster_signals_enabled {
            return;
        }
        while let Some(msg) = self.cluster.recv() {
            debug!(sender = %msg.sender, kind = %msg.kind, "cluster signal");
            for entry in self.core.ado.pool_map.values() {
                entry
                    .handle
                    .proxy()
                    .send_cluster_event(&msg.sender, &msg.kind, &msg.content);
            }
        }
    }

    fn close_all_ado(&mut self) {
        if self.core.ado.by_name.is_empty() {
            return;
        }
        info!("shard: signalling ADOs to shut down");
        self.core.ado.pool_map.clear();
        self.core.ado.pins.clear();
        let handles: Vec<AdoHandle> = self.core.ado.by_name.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let pool = handle.proxy().pool_id();
            for lock in handle.proxy().take_life_unlocks() {
                if let Err(s) = self.core.backend.unlock(pool, lock, false) {
                    warn!(pool, %s, "lifetime unlock at shutdown");
                }
            }
            handle.shutdown_once();
        }
    }

    pub fn exited(&self) -> bool {
        self.exit
    }

    // === Introspection for tests and operators ===

    pub fn stats(&self) -> &ShardStats {
        &self.core.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn backend(&self) -> &dyn KvStore {
        self.core.backend.as_ref()
    }

    pub fn locked_shared_count(&self) -> usize {
        self.core.locked_shared.len()
    }

    pub fn locked_exclusive_count(&self) -> usize {
        self.core.locked_exclusive.len()
    }

    pub fn space_count(&self) -> usize {
        self.core.spaces.len()
    }

    pub fn pending_rename_count(&self) -> usize {
        self.core.renames.len()
    }

    pub fn outstanding_work_count(&self) -> usize {
        self.core.work.len()
    }

    pub fn failed_async_count(&self) -> usize {
        self.core.failed_async.len()
    }

    /// `(request_id, status)` of parked failed asynchronous ADO requests.
    pub fn failed_async_requests(&self) -> Vec<(u64, kvapi::Status)> {
        self.core
            .failed_async
            .iter()
            .map(|f| (f.record.request_id, f.status))
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.core.tasks.len()
    }

    pub fn ado_proxy_count(&self) -> usize {
        self.core.ado.by_name.len()
    }
}
