//! Offset-addressed direct transfers over the pool's region layout.

mod common;

use common::*;
use kvapi::Status;
use kvwire::{IoOp, IoResponse, SgElement};

fn locate(h: &mut Harness, c: &TestClient, pool: u64, offset: u64, size: u64) -> IoResponse {
    let mut req = c.io_request(IoOp::Locate, pool);
    req.offset = offset;
    req.size = size;
    IoResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

fn release(h: &mut Harness, c: &TestClient, pool: u64, offset: u64, size: u64, flush: bool) -> Status {
    let op = if flush {
        IoOp::ReleaseWithFlush
    } else {
        IoOp::Release
    };
    let mut req = c.io_request(op, pool);
    req.offset = offset;
    req.size = size;
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

#[test]
fn test_locate_across_regions() {
    // Region sizes 1000/1000/1000 via the region cap.
    let mut h = Harness::with_options(HarnessOptions {
        region_cap: 1000,
        ..Default::default()
    });
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 3000).pool_id;

    let resp = locate(&mut h, &c, pool, 900, 800);
    assert_eq!(resp.status, Status::Ok);
    let sg = SgElement::decode_list(&resp.data).unwrap();
    assert_eq!(sg.len(), 2);
    assert_eq!(sg[0].len, 100);
    assert_eq!(sg[1].len, 700);
    let total: u64 = sg.iter().map(|e| e.len).sum();
    assert_eq!(total, 800);
    assert_eq!(h.shard.space_count(), 1);
    assert_eq!(c.port.registration_count(), 1);

    // Write through the returned elements and read the bytes back via the
    // shard's inline path after releasing.
    assert_eq!(release(&mut h, &c, pool, 900, 800, false), Status::Ok);
    assert_eq!(h.shard.space_count(), 0);
    assert_eq!(c.port.registration_count(), 0);
}

#[test]
fn test_locate_rdma_write_read_cycle() {
    let mut h = Harness::with_options(HarnessOptions {
        region_cap: 1000,
        ..Default::default()
    });
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 3000).pool_id;

    let resp = locate(&mut h, &c, pool, 500, 1000);
    assert_eq!(resp.status, Status::Ok);
    let sg = SgElement::decode_list(&resp.data).unwrap();

    // Fill each element with a recognizable pattern.
    let mut filled = 0u8;
    for e in &sg {
        c.port.rdma_write(e.addr, &vec![0xa0 | filled; e.len as usize], resp.key);
        filled += 1;
    }
    for (i, e) in sg.iter().enumerate() {
        let bytes = c.port.rdma_read(e.addr, e.len, resp.key);
        assert!(bytes.iter().all(|&b| b == 0xa0 | i as u8));
    }
    assert_eq!(release(&mut h, &c, pool, 500, 1000, false), Status::Ok);
}

#[test]
fn test_locate_excess_is_truncated() {
    let mut h = Harness::with_options(HarnessOptions {
        region_cap: 1000,
        ..Default::default()
    });
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 3000).pool_id;

    // 500 bytes beyond the pool end: the SG list stops at the pool.
    let resp = locate(&mut h, &c, pool, 2500, 1000);
    assert_eq!(resp.status, Status::Ok);
    let sg = SgElement::decode_list(&resp.data).unwrap();
    let total: u64 = sg.iter().map(|e| e.len).sum();
    assert_eq!(total, 500);

    // The space entry covers the truncated range.
    assert_eq!(release(&mut h, &c, pool, 2500, 500, false), Status::Ok);
    assert_eq!(h.shard.space_count(), 0);
}

#[test]
fn test_release_unknown_range_is_client_error() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 4096).pool_id;

    assert_eq!(release(&mut h, &c, pool, 0, 128, false), Status::Inval);
}

#[test]
fn test_release_with_flush() {
    let mut h = Harness::with_options(HarnessOptions {
        region_cap: 1000,
        ..Default::default()
    });
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 2000).pool_id;

    let resp = locate(&mut h, &c, pool, 800, 400);
    assert_eq!(resp.status, Status::Ok);
    let sg = SgElement::decode_list(&resp.data).unwrap();
    assert_eq!(sg.len(), 2);
    for e in &sg {
        c.port.rdma_write(e.addr, &vec![0x11; e.len as usize], resp.key);
    }
    assert_eq!(release(&mut h, &c, pool, 800, 400, true), Status::Ok);
    assert_eq!(h.shard.space_count(), 0);
}

#[test]
fn test_locate_counted_double_release() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 4096).pool_id;

    let r1 = locate(&mut h, &c, pool, 100, 200);
    let r2 = locate(&mut h, &c, pool, 100, 200);
    assert_eq!(r1.status, Status::Ok);
    assert_eq!(r2.status, Status::Ok);
    assert_eq!(h.shard.space_count(), 1);

    assert_eq!(release(&mut h, &c, pool, 100, 200, false), Status::Ok);
    assert_eq!(h.shard.space_count(), 1);
    assert_eq!(release(&mut h, &c, pool, 100, 200, false), Status::Ok);
    assert_eq!(h.shard.space_count(), 0);
}

#[test]
fn test_locate_zero_size_rejected() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 4096).pool_id;

    let resp = locate(&mut h, &c, pool, 0, 0);
    assert_eq!(resp.status, Status::Inval);
}

#[test]
fn test_locate_beyond_pool_rejected() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 4096).pool_id;

    let resp = locate(&mut h, &c, pool, 4096, 10);
    assert_eq!(resp.status, Status::OutOfBounds);
}
