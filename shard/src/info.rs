//! INFO request handling.

use tracing::{debug, warn};

use kvapi::{Attribute, LockKind, Status};
use kvwire::{InfoRequest, InfoResponse, InfoType, StatsResponse};

use crate::dispatch::DispatchError;
use crate::shard::{Core, Session};
use crate::tasks::KeyFindTask;

impl Core {
    pub(crate) fn process_info_request(
        &mut self,
        sess: &mut Session,
        msg: &InfoRequest,
    ) -> Result<(), DispatchError> {
        match msg.info_type {
            InfoType::FindKey => {
                if !self.index_map.contains_key(&msg.pool_id) {
                    warn!(
                        pool = msg.pool_id,
                        "find-key without an index; configure AddIndex::VolatileTree first"
                    );
                    let buf = sess.channel.allocate_send()?;
                    sess.channel
                        .post_response(buf, InfoResponse::new(Status::NoIndex).encode());
                    return Ok(());
                }
                let Ok(expr) = String::from_utf8(msg.key.clone()) else {
                    let buf = sess.channel.allocate_send()?;
                    sess.channel
                        .post_response(buf, InfoResponse::new(Status::Inval).encode());
                    return Ok(());
                };
                debug!(%expr, offset = msg.offset, "spawning key-find task");
                self.tasks.push(Box::new(KeyFindTask::new(
                    expr,
                    msg.offset,
                    sess.token,
                    msg.pool_id,
                )));
                // The response is issued when the task completes.
                Ok(())
            }
            InfoType::GetStats => {
                let buf = sess.channel.allocate_send()?;
                let resp = StatsResponse {
                    status: Status::Ok,
                    stats: self.stats,
                };
                sess.channel.post_response(buf, resp.encode());
                Ok(())
            }
            InfoType::Attr(attr) => {
                let buf = sess.channel.allocate_send()?;
                let key = if msg.key.is_empty() {
                    None
                } else {
                    Some(msg.key.as_slice())
                };
                let mut resp = InfoResponse::new(Status::Ok);
                match self.backend.get_attribute(msg.pool_id, attr, key) {
                    Ok(v) => resp.value = v,
                    Err(s) if attr == Attribute::Crc32 => {
                        debug!(%s, "backend has no CRC32, computing in shard");
                        resp = self.crc32_fallback(msg);
                    }
                    Err(s) => {
                        warn!(%attr, %s, "get_attribute failed");
                        resp.status = s;
                    }
                }
                sess.channel.post_response(buf, resp.encode());
                Ok(())
            }
        }
    }

    /// Lock the value read-only and run CRC32 over its bytes.
    fn crc32_fallback(&mut self, msg: &InfoRequest) -> InfoResponse {
        let mut resp = InfoResponse::new(Status::Ok);
        match self.backend.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(grant) => {
                let bytes = unsafe {
                    std::slice::from_raw_parts(grant.addr as *const u8, grant.len as usize)
                };
                resp.value = crc32fast::hash(bytes) as u64;
                if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                    warn!(%s, "unlock after crc32");
                }
            }
            Err(_) => {
                resp.status = Status::Fail;
            }
        }
        resp
    }
}
