//! In-process proxy/plugin pair.
//!
//! Both halves share queues behind an `Rc`; the shard polls the proxy half
//! from its tick loop, the test (or loopback plugin host) drives the plugin
//! half in between. A shared-memory ring transport slots in here for a real
//! out-of-process deployment.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use kvapi::{IterEntry, IterHandle, LockHandle, PoolId, Region, Status};

use crate::{
    AdoCallback, AdoManager, AdoProxy, AdoReply, OpEvent, PoolDesc, ReferenceVector, UnlockBook,
    WorkCompletion, WorkId, WorkRequest,
};

/// One exposed memory mapping, as seen by the plugin half.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    pub token: u64,
    pub addr: u64,
    pub len: u64,
    pub file: Option<String>,
    pub file_offset: u64,
}

#[derive(Default)]
struct Shared {
    bootstrapped: Option<bool>,
    memory_maps: Vec<MemoryMap>,
    work_requests: VecDeque<WorkRequest>,
    completions: VecDeque<WorkCompletion>,
    callbacks: VecDeque<AdoCallback>,
    replies: VecDeque<AdoReply>,
    op_events: VecDeque<OpEvent>,
    cluster_events: Vec<(String, String, String)>,
    shutdown: bool,
}

type SharedRef = Rc<RefCell<Shared>>;

/// Build a connected (proxy, plugin) pair for `pool`.
pub fn paired(pool_id: PoolId, pool_name: &str) -> (PairedProxy, PluginEndpoint) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    (
        PairedProxy {
            shared: shared.clone(),
            book: UnlockBook::new(),
            pool_id,
            pool_name: pool_name.to_string(),
        },
        PluginEndpoint { shared },
    )
}

// === Proxy half ===

pub struct PairedProxy {
    shared: SharedRef,
    book: UnlockBook,
    pool_id: PoolId,
    pool_name: String,
}

impl AdoProxy for PairedProxy {
    fn bootstrap_ado(&mut self, opened_existing: bool) -> Result<(), Status> {
        self.shared.borrow_mut().bootstrapped = Some(opened_existing);
        Ok(())
    }

    fn send_memory_map(&mut self, token: u64, len: u64, addr: u64) {
        self.shared.borrow_mut().memory_maps.push(MemoryMap {
            token,
            addr,
            len,
            file: None,
            file_offset: 0,
        });
    }

    fn send_memory_map_named(&mut self, token: u64, file: &str, offset: u64, region: Region) {
        self.shared.borrow_mut().memory_maps.push(MemoryMap {
            token,
            addr: region.addr,
            len: region.len,
            file: Some(file.to_string()),
            file_offset: offset,
        });
    }

    fn send_work_request(&mut self, request: WorkRequest) {
        debug!(work_id = request.work_id, pool = self.pool_id, "work request");
        self.shared.borrow_mut().work_requests.push_back(request);
    }

    fn check_work_completions(&mut self) -> Option<WorkCompletion> {
        self.shared.borrow_mut().completions.pop_front()
    }

    fn recv_callback(&mut self) -> Option<AdoCallback> {
        self.shared.borrow_mut().callbacks.pop_front()
    }

    fn send_table_op_response(
        &mut self,
        status: Status,
        addr: u64,
        len: u64,
        key_handle: Option<LockHandle>,
    ) {
        self.shared.borrow_mut().replies.push_back(AdoReply::TableOp {
            status,
            addr,
            len,
            key_handle,
        });
    }

    fn send_pool_info_response(&mut self, status: Status, json: String) {
        self.shared
            .borrow_mut()
            .replies
            .push_back(AdoReply::PoolInfo { status, json });
    }

    fn send_iterate_response(
        &mut self,
        status: Status,
        iterator: Option<IterHandle>,
        entry: Option<IterEntry>,
    ) {
        self.shared.borrow_mut().replies.push_back(AdoReply::Iterate {
            status,
            iterator,
            entry,
        });
    }

    fn send_vector_response(&mut self, status: Status, vector: ReferenceVector) {
        self.shared
            .borrow_mut()
            .replies
            .push_back(AdoReply::Vector { status, vector });
    }

    fn send_find_index_response(&mut self, status: Status, position: u64, key: &[u8]) {
        self.shared.borrow_mut().replies.push_back(AdoReply::FindIndex {
            status,
            position,
            key: key.to_vec(),
        });
    }

    fn send_unlock_response(&mut self, status: Status) {
        self.shared
            .borrow_mut()
            .replies
            .push_back(AdoReply::Unlock { status });
    }

    fn send_configure_response(&mut self, status: Status) {
        self.shared
            .borrow_mut()
            .replies
            .push_back(AdoReply::Configure { status });
    }

    fn send_op_event(&mut self, event: OpEvent) {
        self.shared.borrow_mut().op_events.push_back(event);
    }

    fn send_cluster_event(&mut self, sender: &str, kind: &str, content: &str) {
        self.shared.borrow_mut().cluster_events.push((
            sender.to_string(),
            kind.to_string(),
            content.to_string(),
        ));
    }

    fn shutdown(&mut self) {
        debug!(pool = self.pool_id, "ado shutdown");
        self.shared.borrow_mut().shutdown = true;
    }

    fn add_deferred_unlock(&mut self, work_id: WorkId, handle: LockHandle) -> Result<(), Status> {
        self.book.add_deferred(work_id, handle)
    }

    fn update_deferred_unlock(
        &mut self,
        work_id: WorkId,
        handle: LockHandle,
    ) -> Result<(), Status> {
        self.book.update_deferred(work_id, handle)
    }

    fn take_deferred_unlocks(&mut self, work_id: WorkId) -> Vec<LockHandle> {
        self.book.take_deferred(work_id)
    }

    fn add_life_unlock(&mut self, handle: LockHandle) {
        self.book.add_life(handle)
    }

    fn remove_life_unlock(&mut self, handle: LockHandle) -> Result<(), Status> {
        self.book.remove_life(handle)
    }

    fn has_implicit_unlock(&mut self, work_id: WorkId, handle: LockHandle) -> bool {
        self.book.has_deferred(work_id, handle)
    }

    fn take_life_unlocks(&mut self) -> Vec<LockHandle> {
        self.book.take_life()
    }

    fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn pool_name(&self) -> &str {
        &self.pool_name
    }
}

// === Plugin half ===

/// The plugin side of a paired connection. Tests use it to script ADO
/// behavior between shard ticks.
pub struct PluginEndpoint {
    shared: SharedRef,
}

impl PluginEndpoint {
    pub fn recv_work(&self) -> Option<WorkRequest> {
        self.shared.borrow_mut().work_requests.pop_front()
    }

    pub fn complete(&self, completion: WorkCompletion) {
        self.shared.borrow_mut().completions.push_back(completion);
    }

    pub fn callback(&self, cb: AdoCallback) {
        self.shared.borrow_mut().callbacks.push_back(cb);
    }

    pub fn recv_reply(&self) -> Option<AdoReply> {
        self.shared.borrow_mut().replies.pop_front()
    }

    pub fn recv_op_event(&self) -> Option<OpEvent> {
        self.shared.borrow_mut().op_events.pop_front()
    }

    pub fn bootstrapped(&self) -> Option<bool> {
        self.shared.borrow().bootstrapped
    }

    pub fn memory_maps(&self) -> Vec<MemoryMap> {
        self.shared.borrow().memory_maps.clone()
    }

    pub fn cluster_events(&self) -> Vec<(String, String, String)> {
        self.shared.borrow().cluster_events.clone()
    }

    pub fn was_shutdown(&self) -> bool {
        self.shared.borrow().shutdown
    }
}

// === Manager ===

/// Manager producing paired proxies; plugin halves are parked in a hub for
/// the driver to claim.
pub struct PairedAdoManager {
    hub: EndpointHub,
}

#[derive(Clone, Default)]
pub struct EndpointHub {
    endpoints: Rc<RefCell<Vec<(String, PluginEndpoint)>>>,
}

impl EndpointHub {
    /// Claim the plugin half spawned for `pool_name`.
    pub fn take(&self, pool_name: &str) -> Option<PluginEndpoint> {
        let mut eps = self.endpoints.borrow_mut();
        let i = eps.iter().position(|(n, _)| n == pool_name)?;
        Some(eps.swap_remove(i).1)
    }

    pub fn spawned_count(&self) -> usize {
        self.endpoints.borrow().len()
    }
}

impl PairedAdoManager {
    pub fn new() -> (Self, EndpointHub) {
        let hub = EndpointHub::default();
        (PairedAdoManager { hub: hub.clone() }, hub)
    }
}

impl AdoManager for PairedAdoManager {
    fn create(
        &mut self,
        _auth_id: u64,
        pool_id: PoolId,
        desc: &PoolDesc,
        _plugins: &[String],
        _params: &[(String, String)],
        _net_addr: &str,
    ) -> Result<Box<dyn AdoProxy>, Status> {
        let (proxy, endpoint) = paired(pool_id, &desc.name);
        self.hub
            .endpoints
            .borrow_mut()
            .push((desc.name.clone(), endpoint));
        Ok(Box::new(proxy))
    }
}
