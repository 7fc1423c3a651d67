//! In-process loopback provider.
//!
//! A [`LoopbackFabric`] hands out connected pairs: the server half is a
//! [`Channel`] surfaced through [`LoopbackListener::accept_one`], the client
//! half is a [`ClientPort`]. Frames are byte buffers moved through shared
//! queues; `rdma_read`/`rdma_write` on the port stand in for one-sided
//! transfers and are checked against the live registration table.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use crate::{
    Action, BufSlot, Channel, FabricError, Listener, MemoryRegistration, Registration,
    ResourceUnavailable, SendBuf, Tick,
};

/// Default send-buffer pool depth per session.
pub const DEFAULT_SEND_BUFFER_COUNT: usize = 8;

/// Default send-buffer capacity in bytes.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 4096;

struct RegEntry {
    rkey: u64,
    addr: u64,
    len: u64,
}

struct Shared {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    actions: VecDeque<Action>,
    client_alive: bool,
    allocated: usize,
    send_cap: usize,
    regs: Vec<RegEntry>,
    next_rkey: u64,
    ondemand_count: usize,
}

impl Shared {
    fn covering_reg(&self, addr: u64, len: u64) -> Option<&RegEntry> {
        self.regs
            .iter()
            .find(|r| r.addr <= addr && addr + len <= r.addr + r.len)
    }
}

type SharedRef = Rc<RefCell<Shared>>;

// === Server half ===

pub struct LoopbackChannel {
    shared: SharedRef,
    auth_id: u64,
    io_buffer_size: usize,
}

struct LoopbackSlot {
    shared: SharedRef,
}

impl BufSlot for LoopbackSlot {}

impl Drop for LoopbackSlot {
    fn drop(&mut self) {
        self.shared.borrow_mut().allocated -= 1;
    }
}

struct LoopbackRegistration {
    shared: SharedRef,
    rkey: u64,
    addr: u64,
    len: u64,
}

impl Registration for LoopbackRegistration {
    fn rkey(&self) -> u64 {
        self.rkey
    }

    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> u64 {
        self.len
    }
}

impl Drop for LoopbackRegistration {
    fn drop(&mut self) {
        let mut s = self.shared.borrow_mut();
        s.regs.retain(|r| r.rkey != self.rkey);
    }
}

impl Channel for LoopbackChannel {
    fn tick(&mut self) -> Tick {
        let s = self.shared.borrow();
        if !s.client_alive && s.inbound.is_empty() {
            Tick::Close
        } else if s.inbound.is_empty() && s.actions.is_empty() {
            Tick::Idle
        } else {
            Tick::Progress
        }
    }

    fn peek_pending_msg(&self) -> Option<Vec<u8>> {
        self.shared.borrow().inbound.front().cloned()
    }

    fn pop_pending_msg(&mut self) {
        self.shared.borrow_mut().inbound.pop_front();
    }

    fn next_pending_action(&mut self) -> Option<Action> {
        self.shared.borrow_mut().actions.pop_front()
    }

    fn allocate_send(&mut self) -> Result<SendBuf, ResourceUnavailable> {
        let mut s = self.shared.borrow_mut();
        if s.outbound.len() + s.allocated >= s.send_cap {
            return Err(ResourceUnavailable);
        }
        s.allocated += 1;
        drop(s);
        Ok(SendBuf::new(Box::new(LoopbackSlot {
            shared: self.shared.clone(),
        })))
    }

    fn post_response(&mut self, buf: SendBuf, bytes: Vec<u8>) {
        self.shared.borrow_mut().outbound.push_back(bytes);
        drop(buf.into_slot());
    }

    fn post_response2(&mut self, buf: SendBuf, mut bytes: Vec<u8>, addr: u64, len: u64, rkey: u64) {
        {
            let s = self.shared.borrow();
            let reg = s
                .covering_reg(addr, len)
                .unwrap_or_else(|| panic!("post_response2 over unregistered range {:#x}", addr));
            assert_eq!(reg.rkey, rkey, "post_response2 rkey mismatch");
        }
        // The value memory is pinned for the registration lifetime; reading
        // it here plays the role of the second DMA buffer.
        let value =
            unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) }.to_vec();
        bytes.extend_from_slice(&value);
        self.shared.borrow_mut().outbound.push_back(bytes);
        drop(buf.into_slot());
    }

    fn register_memory(
        &mut self,
        addr: u64,
        len: u64,
    ) -> Result<MemoryRegistration, FabricError> {
        if len == 0 {
            return Err(FabricError::RegistrationFailed("zero length".to_string()));
        }
        let mut s = self.shared.borrow_mut();
        let rkey = s.next_rkey;
        s.next_rkey += 1;
        s.regs.push(RegEntry { rkey, addr, len });
        Ok(Box::new(LoopbackRegistration {
            shared: self.shared.clone(),
            rkey,
            addr,
            len,
        }))
    }

    fn ondemand_register(&mut self, addr: u64, len: u64) {
        debug!(addr, len, "ondemand register hint");
        self.shared.borrow_mut().ondemand_count += 1;
    }

    fn client_connected(&self) -> bool {
        self.shared.borrow().client_alive
    }

    fn auth_id(&self) -> u64 {
        self.auth_id
    }

    fn io_buffer_size(&self) -> usize {
        self.io_buffer_size
    }
}

// === Client half ===

/// Client endpoint of a loopback connection. Stands in for a remote client
/// plus its RDMA engine in tests.
pub struct ClientPort {
    shared: SharedRef,
}

impl ClientPort {
    pub fn send(&self, frame: Vec<u8>) {
        self.shared.borrow_mut().inbound.push_back(frame);
    }

    pub fn recv(&self) -> Option<Vec<u8>> {
        self.shared.borrow_mut().outbound.pop_front()
    }

    pub fn enqueue_action(&self, action: Action) {
        self.shared.borrow_mut().actions.push_back(action);
    }

    /// One-sided read of a located value.
    ///
    /// # Panics
    /// If `[addr, addr+len)` is not covered by a live registration with the
    /// given rkey. The shard pins the value for the registration lifetime,
    /// so a covered range is valid to read.
    pub fn rdma_read(&self, addr: u64, len: u64, rkey: u64) -> Vec<u8> {
        let s = self.shared.borrow();
        let reg = s
            .covering_reg(addr, len)
            .unwrap_or_else(|| panic!("rdma_read of unregistered range {:#x}", addr));
        assert_eq!(reg.rkey, rkey, "rdma_read rkey mismatch");
        unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) }.to_vec()
    }

    /// One-sided write into a located value.
    ///
    /// # Panics
    /// Same conditions as [`ClientPort::rdma_read`].
    pub fn rdma_write(&self, addr: u64, bytes: &[u8], rkey: u64) {
        let s = self.shared.borrow();
        let reg = s
            .covering_reg(addr, bytes.len() as u64)
            .unwrap_or_else(|| panic!("rdma_write of unregistered range {:#x}", addr));
        assert_eq!(reg.rkey, rkey, "rdma_write rkey mismatch");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
    }

    /// Number of live memory registrations on this session.
    pub fn registration_count(&self) -> usize {
        self.shared.borrow().regs.len()
    }

    /// Number of pre-registration hints the session has issued.
    pub fn ondemand_count(&self) -> usize {
        self.shared.borrow().ondemand_count
    }

    /// Frames queued toward the client that have not been received yet.
    pub fn queued_responses(&self) -> usize {
        self.shared.borrow().outbound.len()
    }
}

impl Drop for ClientPort {
    fn drop(&mut self) {
        self.shared.borrow_mut().client_alive = false;
    }
}

// === Fabric / listener ===

type PendingQueue = Rc<RefCell<VecDeque<Box<dyn Channel>>>>;

/// Factory for connected loopback pairs.
pub struct LoopbackFabric {
    pending: PendingQueue,
    next_auth: Cell<u64>,
    send_buffer_count: usize,
    io_buffer_size: usize,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_SEND_BUFFER_COUNT, DEFAULT_IO_BUFFER_SIZE)
    }

    pub fn with_limits(send_buffer_count: usize, io_buffer_size: usize) -> Self {
        LoopbackFabric {
            pending: Rc::new(RefCell::new(VecDeque::new())),
            next_auth: Cell::new(1),
            send_buffer_count,
            io_buffer_size,
        }
    }

    /// Create a connected pair; the server half becomes available through
    /// the listener on the next accept.
    pub fn connect(&self) -> ClientPort {
        let shared = Rc::new(RefCell::new(Shared {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            actions: VecDeque::new(),
            client_alive: true,
            allocated: 0,
            send_cap: self.send_buffer_count,
            regs: Vec::new(),
            next_rkey: 0x1000,
            ondemand_count: 0,
        }));
        let auth_id = self.next_auth.get();
        self.next_auth.set(auth_id + 1);
        self.pending.borrow_mut().push_back(Box::new(LoopbackChannel {
            shared: shared.clone(),
            auth_id,
            io_buffer_size: self.io_buffer_size,
        }));
        ClientPort { shared }
    }

    pub fn listener(&self) -> LoopbackListener {
        LoopbackListener {
            pending: self.pending.clone(),
        }
    }
}

pub struct LoopbackListener {
    pending: PendingQueue,
}

impl Listener for LoopbackListener {
    fn accept_one(&mut self) -> Option<Box<dyn Channel>> {
        self.pending.borrow_mut().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE;

    #[test]
    fn test_accept_and_frame_round_trip() {
        let fabric = LoopbackFabric::new();
        let port = fabric.connect();
        let mut listener = fabric.listener();

        let mut ch = listener.accept_one().expect("pending connection");
        assert!(listener.accept_one().is_none());

        port.send(vec![1, 2, 3]);
        assert_eq!(ch.tick(), Tick::Progress);
        assert_eq!(ch.peek_pending_msg().as_deref(), Some(&[1, 2, 3][..]));
        // Peek does not consume.
        assert_eq!(ch.peek_pending_msg().as_deref(), Some(&[1, 2, 3][..]));
        ch.pop_pending_msg();
        assert_eq!(ch.tick(), Tick::Idle);

        let buf = ch.allocate_send().unwrap();
        ch.post_response(buf, vec![9, 9]);
        assert_eq!(port.recv(), Some(vec![9, 9]));
        assert_eq!(port.recv(), None);
    }

    #[test]
    fn test_send_buffer_exhaustion() {
        let fabric = LoopbackFabric::with_limits(2, 4096);
        let port = fabric.connect();
        let mut ch = fabric.listener().accept_one().unwrap();

        let a = ch.allocate_send().unwrap();
        let b = ch.allocate_send().unwrap();
        assert!(ch.allocate_send().is_err());

        // Dropping an unposted buffer returns the credit.
        drop(a);
        let c = ch.allocate_send().unwrap();

        // Posted frames hold credit until the client drains them.
        ch.post_response(b, vec![1]);
        ch.post_response(c, vec![2]);
        assert!(ch.allocate_send().is_err());
        port.recv().unwrap();
        ch.allocate_send().unwrap();
    }

    #[test]
    fn test_registration_gates_rdma() {
        let fabric = LoopbackFabric::new();
        let port = fabric.connect();
        let mut ch = fabric.listener().accept_one().unwrap();

        let mut value = vec![0u8; 64];
        let addr = value.as_mut_ptr() as u64;
        let reg = ch.register_memory(addr, 64).unwrap();
        let rkey = reg.rkey();

        port.rdma_write(addr, &[0x5a; 64], rkey);
        assert_eq!(port.rdma_read(addr, 64, rkey), vec![0x5a; 64]);
        assert_eq!(value[0], 0x5a);

        assert_eq!(port.registration_count(), 1);
        drop(reg);
        assert_eq!(port.registration_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unregistered range")]
    fn test_rdma_read_outside_registration_panics() {
        let fabric = LoopbackFabric::new();
        let port = fabric.connect();
        let _ch = fabric.listener().accept_one().unwrap();
        port.rdma_read(0xdead_0000, 8, 1);
    }

    #[test]
    fn test_close_on_client_drop() {
        let fabric = LoopbackFabric::new();
        let port = fabric.connect();
        let mut ch = fabric.listener().accept_one().unwrap();

        port.send(vec![1]);
        drop(port);
        // Remaining inbound frames are still served before close.
        assert_eq!(ch.tick(), Tick::Progress);
        ch.pop_pending_msg();
        assert_eq!(ch.tick(), Tick::Close);
        assert!(!ch.client_connected());
    }

    #[test]
    fn test_action_queue() {
        let fabric = LoopbackFabric::new();
        let port = fabric.connect();
        let mut ch = fabric.listener().accept_one().unwrap();

        port.enqueue_action(Action {
            op: ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE,
            arg: 0x42,
        });
        let a = ch.next_pending_action().unwrap();
        assert_eq!(a.op, ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE);
        assert_eq!(a.arg, 0x42);
        assert!(ch.next_pending_action().is_none());
    }
}
