//! IO request handling: inline put/get/erase, direct (locate/release)
//! transfers by key and by pool offset, and pool configuration.

use tracing::{debug, warn};

use fabric::{Channel, SendBuf};
use kvapi::{KvIndex, LockKind, Region, Status, TimeRange};
use kvwire::{IoOp, IoRequest, IoResponse, SgElement};

use crate::dispatch::DispatchError;
use crate::index::VolatileTreeIndex;
use crate::shard::{Core, Session};

/// Values below this ride inline in the response buffer; at or above it the
/// value is posted as a second registered buffer.
pub const TWO_STAGE_THRESHOLD: u64 = 2048;

/// Encoded size of an `IoResponse` without payload.
const IO_RESPONSE_OVERHEAD: usize = 48;

/// Temporary-key prefix for crash-recoverable direct puts.
const PENDING_PREFIX: &[u8] = b"___pending_";

/// Value memory is pinned between lock and unlock; reads through the locked
/// address are valid for that window.
unsafe fn value_slice<'a>(addr: u64, len: u64) -> &'a [u8] {
    std::slice::from_raw_parts(addr as *const u8, len as usize)
}

fn post_status(chan: &mut Box<dyn Channel>, buf: SendBuf, request_id: u64, status: Status) {
    chan.post_response(buf, IoResponse::new(status, request_id).encode());
}

// === Offset mapping ===

/// Scatter-gather mapping of an offset range onto pool regions.
#[derive(Debug)]
pub struct SgResult {
    pub sg_list: Vec<SgElement>,
    pub mr_low: u64,
    pub mr_high: u64,
    /// Bytes of the request beyond the end of the pool.
    pub excess_length: u64,
}

/// Per-region `(base address, cumulative end offset, length)`.
pub fn region_breaks(regions: &[Region]) -> Vec<(u64, u64, u64)> {
    let mut out = Vec::with_capacity(regions.len());
    let mut cumulative = 0u64;
    for r in regions {
        cumulative += r.len;
        out.push((r.addr, cumulative, r.len));
    }
    out
}

/// Convert `[a, b)` in pool-offset space to a scatter-gather list over the
/// region layout. The final element is clamped to the pool end; the cut is
/// reported as `excess_length`. `None` when the start offset is outside the
/// pool.
pub fn offset_to_sg_list(range: (u64, u64), breaks: &[(u64, u64, u64)]) -> Option<SgResult> {
    let (a, b) = range;
    if breaks.is_empty() || b < a {
        return None;
    }
    let prev_cumulative = |i: usize| if i == 0 { 0 } else { breaks[i - 1].1 };

    let i_begin = breaks.partition_point(|&(_, cumulative, _)| cumulative <= a);
    if i_begin >= breaks.len() {
        return None;
    }
    let i_end = breaks.partition_point(|&(_, cumulative, _)| cumulative <= b);
    let i_last = i_end.min(breaks.len() - 1);

    let mut begin_off = a - prev_cumulative(i_begin);
    let end_off = b - prev_cumulative(i_last);

    let mut sg_list = Vec::with_capacity(i_last - i_begin + 1);
    let mut mr_low = u64::MAX;
    let mut mr_high = u64::MIN;

    for &(base, _, len) in &breaks[i_begin..i_last] {
        let lo = base + begin_off;
        let hi = base + len;
        mr_low = mr_low.min(lo);
        mr_high = mr_high.max(hi);
        sg_list.push(SgElement { addr: lo, len: hi - lo });
        begin_off = 0;
    }

    let (base, _, len) = breaks[i_last];
    let excess_length = end_off.saturating_sub(len);
    let lo = base + begin_off;
    let hi = base + end_off - excess_length;
    mr_low = mr_low.min(lo);
    mr_high = mr_high.max(hi);
    sg_list.push(SgElement { addr: lo, len: hi - lo });

    Some(SgResult {
        sg_list,
        mr_low,
        mr_high,
        excess_length,
    })
}

// === Handlers ===

impl Core {
    pub(crate) fn process_io_request(
        &mut self,
        sess: &mut Session,
        msg: &IoRequest,
    ) -> Result<(), DispatchError> {
        match msg.op {
            IoOp::Put => self.io_put(sess, msg),
            IoOp::Get => self.io_get(sess, msg),
            IoOp::Erase => self.io_erase(sess, msg),
            IoOp::PutAdvance => self.io_put_direct(sess, msg, true),
            IoOp::PutLocate => self.io_put_direct(sess, msg, false),
            IoOp::PutRelease => self.io_put_release(sess, msg),
            IoOp::GetLocate => self.io_get_locate(sess, msg),
            IoOp::GetRelease => self.io_get_release(sess, msg),
            IoOp::Locate => self.io_locate(sess, msg),
            IoOp::Release => self.io_release(sess, msg, false),
            IoOp::ReleaseWithFlush => self.io_release(sess, msg, true),
            IoOp::Configure => self.io_configure(sess, msg),
        }
    }

    fn io_put(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let status = match self.backend.put(
            msg.pool_id,
            &msg.key,
            &msg.value,
            msg.flags.store_flags(),
        ) {
            Ok(()) => {
                self.add_index_key(msg.pool_id, &msg.key);
                Status::Ok
            }
            Err(s) => {
                debug!(%s, "put failed");
                self.stats.op_failed_request_count += 1;
                s
            }
        };
        self.stats.op_put_count += 1;
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    fn io_get(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let direct = msg.flags.contains(kvwire::IoFlags::DIRECT);

        let grant = match self.backend.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(g) => g,
            Err(s) => {
                debug!(%s, "get: locking value failed");
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, s);
                return Ok(());
            }
        };

        if !direct && grant.len < TWO_STAGE_THRESHOLD {
            // Small value: copy into the response and unlock immediately.
            let mut resp = IoResponse::new(Status::Ok, msg.request_id);
            resp.data = unsafe { value_slice(grant.addr, grant.len) }.to_vec();
            resp.data_len = grant.len;
            if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, true) {
                warn!(%s, "get: unlock after copy");
            }
            self.stats.op_get_count += 1;
            sess.channel.post_response(buf, resp.encode());
            return Ok(());
        }

        // Two-stage response.
        let client_capacity = msg.size;
        if client_capacity < grant.len {
            if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                warn!(%s, "get: unlock after capacity miss");
            }
            self.stats.op_failed_request_count += 1;
            post_status(
                &mut sess.channel,
                buf,
                msg.request_id,
                Status::InsufficientSpace,
            );
            return Ok(());
        }

        let fits_second_buffer = !direct
            && grant.len as usize <= sess.channel.io_buffer_size() - IO_RESPONSE_OVERHEAD;
        if !fits_second_buffer {
            // The client must retry via GET_LOCATE; hold no lock meanwhile.
            if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                warn!(%s, "get: unlock after oversize");
            }
            self.stats.op_failed_request_count += 1;
            post_status(&mut sess.channel, buf, msg.request_id, Status::TooLarge);
            return Ok(());
        }

        match sess.channel.register_memory(grant.addr, grant.len) {
            Ok(reg) => {
                if self
                    .locked_shared
                    .add(msg.pool_id, grant.handle, grant.addr, grant.len, reg)
                {
                    // Already tracked: return the duplicate backend lock;
                    // the first registration stays authoritative.
                    let _ = self.backend.unlock(msg.pool_id, grant.handle, false);
                }
                let rkey = self
                    .locked_shared
                    .get(grant.addr)
                    .map(|e| e.rkey())
                    .unwrap_or(0);
                let mut resp = IoResponse::new(Status::Ok, msg.request_id);
                resp.addr = grant.addr;
                resp.key = rkey;
                resp.data_len = grant.len;
                self.stats.op_get_twostage_count += 1;
                sess.channel
                    .post_response2(buf, resp.encode(), grant.addr, grant.len, rkey);
            }
            Err(e) => {
                warn!(%e, "get: registration failed");
                if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                    warn!(%s, "get: unlock after registration failure");
                }
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, Status::Fail);
            }
        }
        Ok(())
    }

    fn io_erase(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let status = match self.backend.erase(msg.pool_id, &msg.key) {
            Ok(()) => {
                self.remove_index_key(msg.pool_id, &msg.key);
                Status::Ok
            }
            Err(s) => {
                self.stats.op_failed_request_count += 1;
                s
            }
        };
        self.stats.op_erase_count += 1;
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    /// Shared path for PUT_ADVANCE and PUT_LOCATE. The value is created (if
    /// needed) under a provisional name and pinned for the client's RDMA
    /// write; PUT_RELEASE later discharges the rename.
    fn io_put_direct(
        &mut self,
        sess: &mut Session,
        msg: &IoRequest,
        require_len_match: bool,
    ) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;

        if msg.flags.contains(kvwire::IoFlags::DONT_STOMP) {
            warn!("direct put cannot honor DONT_STOMP");
            self.stats.op_failed_request_count += 1;
            post_status(&mut sess.channel, buf, msg.request_id, Status::Inval);
            return Ok(());
        }
        if msg.size == 0 {
            self.stats.op_failed_request_count += 1;
            post_status(&mut sess.channel, buf, msg.request_id, Status::Inval);
            return Ok(());
        }

        let pending_key = [PENDING_PREFIX, msg.key.as_slice()].concat();
        let grant = match self
            .backend
            .lock(msg.pool_id, &pending_key, LockKind::Write, msg.size)
        {
            Ok(g) => g,
            Err(s) => {
                warn!(%s, "direct put failed to lock value");
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, Status::Fail);
                return Ok(());
            }
        };

        if require_len_match && grant.len != msg.size {
            warn!(
                existing = grant.len,
                requested = msg.size,
                "existing entry length does not match request"
            );
            if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                warn!(%s, "direct put: unlock after length mismatch");
            }
            self.stats.op_failed_request_count += 1;
            post_status(&mut sess.channel, buf, msg.request_id, Status::Inval);
            return Ok(());
        }

        match sess.channel.register_memory(grant.addr, grant.len) {
            Ok(reg) => {
                let rkey = reg.rkey();
                // A re-lock of a live exclusive entry cannot happen (the
                // second backend lock would have failed), so this insert
                // never bumps.
                self.locked_exclusive
                    .add(msg.pool_id, grant.handle, grant.addr, grant.len, reg);
                self.renames
                    .add(grant.addr, msg.pool_id, pending_key, msg.key.clone())?;
                let mut resp = IoResponse::new(Status::Ok, msg.request_id);
                resp.addr = grant.addr;
                resp.key = rkey;
                resp.data_len = grant.len;
                self.stats.op_put_direct_count += 1;
                sess.channel.post_response(buf, resp.encode());
            }
            Err(e) => {
                warn!(%e, "direct put: registration failed");
                if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                    warn!(%s, "direct put: unlock after registration failure");
                }
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, Status::Fail);
            }
        }
        Ok(())
    }

    fn io_put_release(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        debug!(addr = msg.addr, "put release");
        let status = if self.locked_exclusive.contains(msg.addr) {
            self.release_locked_value_exclusive(msg.addr)?;
            self.release_pending_rename(msg.addr)?;
            Status::Ok
        } else {
            Status::Inval
        };
        self.stats.op_put_count += 1;
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    fn io_get_locate(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let grant = match self.backend.lock(msg.pool_id, &msg.key, LockKind::Read, 0) {
            Ok(g) => g,
            Err(s) => {
                debug!(%s, "get locate failed to lock value");
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, s);
                return Ok(());
            }
        };
        match sess.channel.register_memory(grant.addr, grant.len) {
            Ok(reg) => {
                if self
                    .locked_shared
                    .add(msg.pool_id, grant.handle, grant.addr, grant.len, reg)
                {
                    let _ = self.backend.unlock(msg.pool_id, grant.handle, false);
                }
                let rkey = self
                    .locked_shared
                    .get(grant.addr)
                    .map(|e| e.rkey())
                    .unwrap_or(0);
                let mut resp = IoResponse::new(Status::Ok, msg.request_id);
                resp.addr = grant.addr;
                resp.key = rkey;
                resp.data_len = grant.len;
                self.stats.op_get_direct_count += 1;
                sess.channel.post_response(buf, resp.encode());
            }
            Err(e) => {
                warn!(%e, "get locate: registration failed");
                if let Err(s) = self.backend.unlock(msg.pool_id, grant.handle, false) {
                    warn!(%s, "get locate: unlock after registration failure");
                }
                self.stats.op_failed_request_count += 1;
                post_status(&mut sess.channel, buf, msg.request_id, Status::Fail);
            }
        }
        Ok(())
    }

    fn io_get_release(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        debug!(addr = msg.addr, "get release");
        let status = if self.locked_shared.contains(msg.addr) {
            self.release_locked_value_shared(msg.addr)?;
            Status::Ok
        } else {
            Status::Inval
        };
        self.stats.op_get_count += 1;
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    fn io_locate(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        debug!(offset = msg.offset, size = msg.size, "locate");
        if msg.size == 0 {
            post_status(&mut sess.channel, buf, msg.request_id, Status::Inval);
            return Ok(());
        }
        let regions = match self.backend.pool_regions(msg.pool_id) {
            Ok((_, regions)) => regions,
            Err(s) => {
                post_status(&mut sess.channel, buf, msg.request_id, s);
                return Ok(());
            }
        };
        let breaks = region_breaks(&regions);
        let Some(sgr) = offset_to_sg_list((msg.offset, msg.offset + msg.size), &breaks) else {
            post_status(&mut sess.channel, buf, msg.request_id, Status::OutOfBounds);
            return Ok(());
        };

        // One registration spans the whole transfer, gaps included.
        match sess
            .channel
            .register_memory(sgr.mr_low, sgr.mr_high - sgr.mr_low)
        {
            Ok(reg) => {
                let range = (msg.offset, msg.offset + msg.size - sgr.excess_length);
                self.spaces.add(range, reg);
                // The first registration for a re-located range stays
                // authoritative.
                let rkey = self.spaces.rkey(range).unwrap_or(0);
                let mut resp = IoResponse::new(Status::Ok, msg.request_id);
                resp.key = rkey;
                resp.data = SgElement::encode_list(&sgr.sg_list);
                resp.data_len = resp.data.len() as u64;
                self.stats.op_get_direct_offset_count += 1;
                sess.channel.post_response(buf, resp.encode());
            }
            Err(e) => {
                warn!(%e, "locate: registration failed");
                post_status(&mut sess.channel, buf, msg.request_id, Status::Fail);
            }
        }
        Ok(())
    }

    fn io_release(
        &mut self,
        sess: &mut Session,
        msg: &IoRequest,
        with_flush: bool,
    ) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let range = (msg.offset, msg.offset + msg.size);
        debug!(lo = range.0, hi = range.1, with_flush, "release");

        let mut status = Status::Ok;
        if with_flush {
            match self.backend.pool_regions(msg.pool_id) {
                Ok((_, regions)) => {
                    let breaks = region_breaks(&regions);
                    if let Some(sgr) = offset_to_sg_list(range, &breaks) {
                        for e in &sgr.sg_list {
                            if let Err(s) =
                                self.backend.flush_pool_memory(msg.pool_id, e.addr, e.len)
                            {
                                if status == Status::Ok {
                                    status = s;
                                }
                            }
                        }
                    }
                }
                Err(s) => {
                    post_status(&mut sess.channel, buf, msg.request_id, s);
                    return Ok(());
                }
            }
        }

        if self.spaces.contains(range) {
            self.spaces.release(range)?;
        } else {
            debug!(lo = range.0, hi = range.1, "release of unlocated space");
            status = Status::Inval;
        }
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    fn io_configure(&mut self, sess: &mut Session, msg: &IoRequest) -> Result<(), DispatchError> {
        let buf = sess.channel.allocate_send()?;
        let command = String::from_utf8_lossy(&msg.key).to_string();
        debug!(%command, pool = msg.pool_id, "configure");
        let status = self.process_configure(msg.pool_id, &command);
        post_status(&mut sess.channel, buf, msg.request_id, status);
        Ok(())
    }

    fn process_configure(&mut self, pool: kvapi::PoolId, command: &str) -> Status {
        if let Some(index_kind) = command.strip_prefix("AddIndex::") {
            if index_kind != "VolatileTree" {
                warn!(index_kind, "unknown index kind");
                return Status::BadParam;
            }
            let mut index = VolatileTreeIndex::new();
            let built = self
                .backend
                .map_keys(pool, &mut |k| index.insert(k))
                .or_else(|_| {
                    self.backend.map(
                        pool,
                        &mut |k, _addr, _len, _ts| index.insert(k),
                        TimeRange::UNBOUNDED,
                    )
                });
            match built {
                Ok(n) => {
                    debug!(pool, keys = n, "volatile index rebuilt");
                    self.index_map.insert(pool, index);
                    Status::Ok
                }
                Err(s) => s,
            }
        } else if command == "RemoveIndex::" {
            match self.index_map.remove(&pool) {
                Some(_) => Status::Ok,
                None => Status::BadParam,
            }
        } else {
            warn!(command, "unknown configure command");
            Status::BadParam
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(lens: &[u64]) -> Vec<Region> {
        // Synthetic, well-separated bases.
        lens.iter()
            .enumerate()
            .map(|(i, &len)| Region {
                addr: 0x10_0000 * (i as u64 + 1),
                len,
            })
            .collect()
    }

    #[test]
    fn test_sg_single_region() {
        let r = regions(&[4096]);
        let b = region_breaks(&r);
        let sgr = offset_to_sg_list((100, 300), &b).unwrap();
        assert_eq!(sgr.sg_list, vec![SgElement { addr: r[0].addr + 100, len: 200 }]);
        assert_eq!(sgr.excess_length, 0);
        assert_eq!(sgr.mr_low, r[0].addr + 100);
        assert_eq!(sgr.mr_high, r[0].addr + 300);
    }

    #[test]
    fn test_sg_spans_three_regions() {
        let r = regions(&[1000, 500, 1500]);
        let b = region_breaks(&r);
        let sgr = offset_to_sg_list((900, 1700), &b).unwrap();
        assert_eq!(
            sgr.sg_list,
            vec![
                SgElement { addr: r[0].addr + 900, len: 100 },
                SgElement { addr: r[1].addr, len: 500 },
                SgElement { addr: r[2].addr, len: 200 },
            ]
        );
        assert_eq!(sgr.excess_length, 0);
        let total: u64 = sgr.sg_list.iter().map(|e| e.len).sum();
        assert_eq!(total, 800);
    }

    #[test]
    fn test_sg_boundary_start() {
        let r = regions(&[1000, 500]);
        let b = region_breaks(&r);
        // Starting exactly at a region boundary.
        let sgr = offset_to_sg_list((1000, 1200), &b).unwrap();
        assert_eq!(sgr.sg_list, vec![SgElement { addr: r[1].addr, len: 200 }]);
    }

    #[test]
    fn test_sg_excess_is_clamped() {
        let r = regions(&[1000, 500, 1500]);
        let b = region_breaks(&r);
        let sgr = offset_to_sg_list((0, 3500), &b).unwrap();
        assert_eq!(sgr.excess_length, 500);
        let total: u64 = sgr.sg_list.iter().map(|e| e.len).sum();
        assert_eq!(total, 3000);
        assert_eq!(sgr.sg_list.last().unwrap().len, 1500);
    }

    #[test]
    fn test_sg_start_beyond_pool() {
        let r = regions(&[1000]);
        let b = region_breaks(&r);
        assert!(offset_to_sg_list((1000, 1100), &b).is_none());
        assert!(offset_to_sg_list((5000, 5100), &b).is_none());
    }

    #[test]
    fn test_sg_reconstructs_virtual_layout() {
        // Concatenating the SG elements must reproduce the byte span of the
        // virtual layout for arbitrary in-bounds ranges.
        let r = regions(&[7, 13, 1, 29]);
        let b = region_breaks(&r);
        let total: u64 = r.iter().map(|x| x.len).sum();
        for a in 0..total {
            for bb in a..=total {
                let sgr = offset_to_sg_list((a, bb), &b).unwrap();
                assert_eq!(sgr.excess_length, 0, "[{a},{bb})");
                let sum: u64 = sgr.sg_list.iter().map(|e| e.len).sum();
                assert_eq!(sum, bb - a, "[{a},{bb})");

                // Each element must sit inside exactly one region.
                for e in &sgr.sg_list {
                    assert!(r.iter().any(|reg| reg.addr <= e.addr
                        && e.addr + e.len <= reg.addr + reg.len));
                }
            }
        }
    }
}
