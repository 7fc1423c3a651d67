//! Long-running jobs advanced one step per tick.

use std::collections::HashMap;

use tracing::{debug, warn};

use kvapi::{FindType, KvIndex, PoolId, Status};
use kvwire::InfoResponse;

use crate::index::VolatileTreeIndex;
use crate::shard::{find_session_mut, Core, Session};

/// Index comparisons a key-find task performs per tick.
const FIND_COMPARISONS_PER_TICK: u64 = 1000;

/// Completed task payload, posted as an `InfoResponse`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: Status,
    pub value: u64,
    pub position: u64,
    pub data: Vec<u8>,
}

pub enum TaskOutcome {
    /// Keep the task on the list.
    More,
    /// Post the result and drop the task.
    Done(TaskResult),
}

pub trait Task {
    fn session(&self) -> u64;
    fn do_work(&mut self, index_map: &HashMap<PoolId, VolatileTreeIndex>) -> TaskOutcome;
}

/// Incremental index scan for a key expression.
pub struct KeyFindTask {
    expr: String,
    position: u64,
    session: u64,
    pool: PoolId,
}

impl KeyFindTask {
    pub fn new(expr: String, position: u64, session: u64, pool: PoolId) -> Self {
        KeyFindTask {
            expr,
            position,
            session,
            pool,
        }
    }
}

impl Task for KeyFindTask {
    fn session(&self) -> u64 {
        self.session
    }

    fn do_work(&mut self, index_map: &HashMap<PoolId, VolatileTreeIndex>) -> TaskOutcome {
        let Some(index) = index_map.get(&self.pool) else {
            return TaskOutcome::Done(TaskResult {
                status: Status::Fail,
                value: 0,
                position: 0,
                data: Vec::new(),
            });
        };
        match index.find(
            &self.expr,
            self.position,
            FindType::Regex,
            FIND_COMPARISONS_PER_TICK,
        ) {
            Ok((position, key)) => TaskOutcome::Done(TaskResult {
                status: Status::Ok,
                value: key.len() as u64,
                position,
                data: key,
            }),
            Err(Status::More) => {
                self.position += FIND_COMPARISONS_PER_TICK;
                TaskOutcome::More
            }
            Err(s) => TaskOutcome::Done(TaskResult {
                status: s,
                value: 0,
                position: 0,
                data: Vec::new(),
            }),
        }
    }
}

impl Core {
    /// Advance every task one step; completed tasks post their result to
    /// the originating session.
    pub(crate) fn process_tasks(&mut self, sessions: &mut [Session]) {
        if self.tasks.is_empty() {
            return;
        }
        let mut tasks = std::mem::take(&mut self.tasks);
        tasks.retain_mut(|task| match task.do_work(&self.index_map) {
            TaskOutcome::More => true,
            TaskOutcome::Done(result) => {
                debug!(status = %result.status, "task completed");
                if let Some(sess) = find_session_mut(sessions, task.session()) {
                    match sess.channel.allocate_send() {
                        Ok(buf) => {
                            let mut resp = InfoResponse::new(result.status);
                            resp.value = result.value;
                            resp.offset = result.position;
                            resp.data = result.data;
                            sess.channel.post_response(buf, resp.encode());
                        }
                        Err(e) => {
                            warn!(%e, "no send buffer for task result, dropping");
                        }
                    }
                }
                false
            }
        });
        // Tasks spawned while the list was detached would be lost; append.
        tasks.extend(self.tasks.drain(..));
        self.tasks = tasks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_find_task_resumes_across_ticks() {
        let mut index_map = HashMap::new();
        let mut index = VolatileTreeIndex::new();
        for i in 0..2500u32 {
            index.insert(format!("key_{i:06}").as_bytes());
        }
        index.insert(b"zzz_target");
        index_map.insert(7u64, index);

        let mut task = KeyFindTask::new("zzz_*".to_string(), 0, 1, 7);
        let mut ticks = 0;
        loop {
            ticks += 1;
            match task.do_work(&index_map) {
                TaskOutcome::More => continue,
                TaskOutcome::Done(result) => {
                    assert_eq!(result.status, Status::Ok);
                    assert_eq!(result.data, b"zzz_target");
                    break;
                }
            }
        }
        // 2501 keys at 1000 comparisons per tick.
        assert_eq!(ticks, 3);
    }

    #[test]
    fn test_key_find_task_without_index_fails() {
        let index_map = HashMap::new();
        let mut task = KeyFindTask::new("x".to_string(), 0, 1, 7);
        match task.do_work(&index_map) {
            TaskOutcome::Done(result) => assert_eq!(result.status, Status::Fail),
            TaskOutcome::More => panic!("expected completion"),
        }
    }
}
