//! Process-wide services shared by all shards.
//!
//! Both are explicitly constructed in the binary and handed to every shard;
//! neither is a free-floating global.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Broadcast message fanned out to every shard's ADO processes.
#[derive(Debug, Clone)]
pub struct ClusterMessage {
    pub sender: String,
    pub kind: String,
    pub content: String,
}

/// Bounded broadcast queue. Each shard drains its own clone on its own tick
/// schedule.
#[derive(Clone, Default)]
pub struct ClusterSignalQueue {
    inner: Arc<Mutex<VecDeque<ClusterMessage>>>,
}

const CLUSTER_QUEUE_CAP: usize = 1024;

impl ClusterSignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message; the oldest entry is dropped at capacity.
    pub fn send(&self, msg: ClusterMessage) {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= CLUSTER_QUEUE_CAP {
            q.pop_front();
        }
        q.push_back(msg);
    }

    pub fn recv(&self) -> Option<ClusterMessage> {
        self.inner.lock().unwrap().pop_front()
    }
}

/// Registry of claimed device-DAX paths; prevents two shards from mapping
/// the same file.
#[derive(Clone, Default)]
pub struct DaxRegistry {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DaxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a path. Returns false when another shard already holds it.
    pub fn claim(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().insert(path.to_path_buf())
    }

    pub fn release(&self, path: &Path) {
        self.inner.lock().unwrap().remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let q = ClusterSignalQueue::new();
        assert!(q.recv().is_none());
        q.send(ClusterMessage {
            sender: "a".into(),
            kind: "t".into(),
            content: "1".into(),
        });
        q.send(ClusterMessage {
            sender: "b".into(),
            kind: "t".into(),
            content: "2".into(),
        });
        assert_eq!(q.recv().unwrap().content, "1");
        assert_eq!(q.recv().unwrap().content, "2");
        assert!(q.recv().is_none());
    }

    #[test]
    fn test_dax_registry_refuses_duplicates() {
        let r = DaxRegistry::new();
        let p = Path::new("/dev/dax0.0");
        assert!(r.claim(p));
        assert!(!r.claim(p));
        r.release(p);
        assert!(r.claim(p));
    }
}
