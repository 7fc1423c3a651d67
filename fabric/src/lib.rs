//! Transport contract consumed by the shard, plus an in-process loopback
//! provider.
//!
//! The shard never talks to a wire directly; it owns a [`Listener`] that
//! yields one [`Channel`] per client session. A channel carries received
//! protocol frames (opaque byte buffers), a deferred-action queue, a finite
//! send-buffer pool, and the memory-registration primitive used for direct
//! transfers.

pub mod loopback;

use std::fmt;

/// Result of one channel tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Progress,
    /// The client went away; the session should be torn down.
    Close,
}

/// Deferred action delivered out-of-band by the transport layer.
///
/// `op` is a raw discriminant on purpose: the shard treats an unknown op as
/// an invariant violation rather than silently skipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub op: u32,
    pub arg: u64,
}

/// Release an exclusively locked value identified by its address.
pub const ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE: u32 = 1;

/// Transient send-buffer exhaustion. The caller leaves the triggering
/// message on the pending queue and retries on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUnavailable;

impl fmt::Display for ResourceUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no send buffer available")
    }
}

impl std::error::Error for ResourceUnavailable {}

/// Non-transient fabric failures.
#[derive(Debug)]
pub enum FabricError {
    Disconnected,
    RegistrationFailed(String),
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::Disconnected => write!(f, "peer disconnected"),
            FabricError::RegistrationFailed(why) => {
                write!(f, "memory registration failed: {}", why)
            }
        }
    }
}

impl std::error::Error for FabricError {}

/// An active memory registration. Dropping it deregisters the range.
pub trait Registration {
    fn rkey(&self) -> u64;
    fn addr(&self) -> u64;
    fn len(&self) -> u64;
}

pub type MemoryRegistration = Box<dyn Registration>;

/// A send buffer claimed from a channel's finite pool. Dropping without a
/// post returns the credit.
pub struct SendBuf {
    slot: Box<dyn BufSlot>,
}

impl SendBuf {
    pub fn new(slot: Box<dyn BufSlot>) -> Self {
        SendBuf { slot }
    }

    pub(crate) fn into_slot(self) -> Box<dyn BufSlot> {
        self.slot
    }
}

/// Provider-side half of a send buffer.
pub trait BufSlot {}

/// One client session.
pub trait Channel {
    /// Progress the connection. Called once per main-loop iteration.
    fn tick(&mut self) -> Tick;

    /// Front of the pending-message queue, if any. The frame stays queued
    /// until [`Channel::pop_pending_msg`].
    fn peek_pending_msg(&self) -> Option<Vec<u8>>;

    fn pop_pending_msg(&mut self);

    fn next_pending_action(&mut self) -> Option<Action>;

    fn allocate_send(&mut self) -> Result<SendBuf, ResourceUnavailable>;

    /// Post one encoded message.
    fn post_response(&mut self, buf: SendBuf, bytes: Vec<u8>);

    /// Post an encoded message plus a registered value region in one frame.
    fn post_response2(&mut self, buf: SendBuf, bytes: Vec<u8>, addr: u64, len: u64, rkey: u64);

    fn register_memory(&mut self, addr: u64, len: u64)
        -> Result<MemoryRegistration, FabricError>;

    /// Pre-registration hint; failures are logged, never surfaced.
    fn ondemand_register(&mut self, addr: u64, len: u64);

    fn client_connected(&self) -> bool;

    fn auth_id(&self) -> u64;

    /// Capacity of one send buffer; bounds two-buffer responses.
    fn io_buffer_size(&self) -> usize;
}

/// Accepts new sessions without blocking.
pub trait Listener {
    fn accept_one(&mut self) -> Option<Box<dyn Channel>>;
}
