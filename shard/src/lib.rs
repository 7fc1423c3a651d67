//! Shard orchestrator.
//!
//! One shard is a single worker pinned to one CPU. It owns a fabric
//! listener, one backend store, the lock/space/rename trackers, and the ADO
//! proxies for its open pools, and multiplexes all client sessions through a
//! cooperative tick loop. Nothing in here takes a lock: every structure is
//! touched only by the owning worker thread.

mod ado;
mod affinity;
mod cluster;
mod config;
mod dispatch;
mod index;
mod info;
mod io;
mod pool;
mod shard;
mod tasks;
mod trackers;
mod work;

pub use ado::AdoHandle;
pub use cluster::{ClusterMessage, ClusterSignalQueue, DaxRegistry};
pub use config::{BackendKind, ShardConfig};
pub use dispatch::{DispatchError, FatalError};
pub use index::VolatileTreeIndex;
pub use io::{offset_to_sg_list, region_breaks, SgResult, TWO_STAGE_THRESHOLD};
pub use pool::PoolManager;
pub use shard::Shard;
pub use tasks::{KeyFindTask, Task, TaskOutcome, TaskResult};
pub use work::{WorkRecord, WorkTable};

pub use affinity::pin_to_core;
