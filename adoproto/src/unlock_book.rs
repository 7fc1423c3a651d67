//! Deferred and lifetime unlock bookkeeping shared by proxy implementations.

use std::collections::HashMap;

use kvapi::{LockHandle, Status};

use crate::WorkId;

/// Locks taken on behalf of the plugin that the shard releases later:
/// deferred unlocks fire when the owning work item completes, lifetime
/// unlocks fire when the ADO process shuts down.
#[derive(Default)]
pub struct UnlockBook {
    deferred: HashMap<WorkId, Vec<LockHandle>>,
    life: Vec<LockHandle>,
    max_per_work: usize,
}

impl UnlockBook {
    pub fn new() -> Self {
        UnlockBook {
            deferred: HashMap::new(),
            life: Vec::new(),
            max_per_work: 64,
        }
    }

    pub fn add_deferred(&mut self, work_id: WorkId, handle: LockHandle) -> Result<(), Status> {
        let v = self.deferred.entry(work_id).or_default();
        if v.len() >= self.max_per_work {
            return Err(Status::MaxReached);
        }
        v.push(handle);
        Ok(())
    }

    /// Replace the most recent deferred handle for `work_id`; `Inval` when
    /// no deferred unlock is registered for it.
    pub fn update_deferred(&mut self, work_id: WorkId, handle: LockHandle) -> Result<(), Status> {
        match self.deferred.get_mut(&work_id).and_then(|v| v.last_mut()) {
            Some(slot) => {
                *slot = handle;
                Ok(())
            }
            None => Err(Status::Inval),
        }
    }

    pub fn take_deferred(&mut self, work_id: WorkId) -> Vec<LockHandle> {
        self.deferred.remove(&work_id).unwrap_or_default()
    }

    pub fn has_deferred(&self, work_id: WorkId, handle: LockHandle) -> bool {
        self.deferred
            .get(&work_id)
            .map(|v| v.contains(&handle))
            .unwrap_or(false)
    }

    pub fn add_life(&mut self, handle: LockHandle) {
        self.life.push(handle);
    }

    pub fn remove_life(&mut self, handle: LockHandle) -> Result<(), Status> {
        match self.life.iter().position(|&h| h == handle) {
            Some(i) => {
                self.life.swap_remove(i);
                Ok(())
            }
            None => Err(Status::Inval),
        }
    }

    pub fn take_life(&mut self) -> Vec<LockHandle> {
        std::mem::take(&mut self.life)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_lifecycle() {
        let mut book = UnlockBook::new();
        book.add_deferred(1, LockHandle(10)).unwrap();
        book.add_deferred(1, LockHandle(11)).unwrap();
        book.add_deferred(2, LockHandle(20)).unwrap();

        assert!(book.has_deferred(1, LockHandle(10)));
        assert!(!book.has_deferred(1, LockHandle(20)));

        // Resize swaps the latest handle.
        book.update_deferred(1, LockHandle(12)).unwrap();
        assert!(book.has_deferred(1, LockHandle(12)));
        assert!(!book.has_deferred(1, LockHandle(11)));

        let taken = book.take_deferred(1);
        assert_eq!(taken, vec![LockHandle(10), LockHandle(12)]);
        assert!(book.take_deferred(1).is_empty());

        assert_eq!(book.update_deferred(3, LockHandle(1)), Err(Status::Inval));
    }

    #[test]
    fn test_deferred_cap() {
        let mut book = UnlockBook::new();
        for i in 0..64 {
            book.add_deferred(7, LockHandle(i)).unwrap();
        }
        assert_eq!(
            book.add_deferred(7, LockHandle(64)),
            Err(Status::MaxReached)
        );
    }

    #[test]
    fn test_life_locks() {
        let mut book = UnlockBook::new();
        book.add_life(LockHandle(1));
        book.add_life(LockHandle(2));
        assert_eq!(book.remove_life(LockHandle(9)), Err(Status::Inval));
        book.remove_life(LockHandle(1)).unwrap();
        assert_eq!(book.take_life(), vec![LockHandle(2)]);
        assert!(book.take_life().is_empty());
    }
}
