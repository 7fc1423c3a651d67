//! Error classes crossing the dispatcher boundary.

use std::fmt;

use fabric::ResourceUnavailable;

/// Broken in-memory invariant. Unwinds to the worker entry point and
/// terminates the shard; the structures it guards can no longer be trusted.
#[derive(Debug)]
pub struct FatalError {
    message: String,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        FatalError {
            message: message.into(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violation: {}", self.message)
    }
}

impl std::error::Error for FatalError {}

/// Outcome classes of one message dispatch.
#[derive(Debug)]
pub enum DispatchError {
    /// Transient shortage; leave the message queued and retry next tick.
    Resource(ResourceUnavailable),
    /// Invariant violation; terminate the shard.
    Fatal(FatalError),
}

impl From<ResourceUnavailable> for DispatchError {
    fn from(e: ResourceUnavailable) -> Self {
        DispatchError::Resource(e)
    }
}

impl From<FatalError> for DispatchError {
    fn from(e: FatalError) -> Self {
        DispatchError::Fatal(e)
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Resource(e) => write!(f, "{}", e),
            DispatchError::Fatal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}
