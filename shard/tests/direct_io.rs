//! Direct (locate/release) transfers by key: the RDMA fast path, pending
//! renames, and lock bookkeeping.

mod common;

use common::*;
use fabric::{Action, ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE};
use kvapi::Status;
use kvwire::{IoFlags, IoOp, IoResponse};

fn put_locate(h: &mut Harness, c: &TestClient, pool: u64, key: &[u8], len: u64) -> IoResponse {
    let mut req = c.io_request(IoOp::PutLocate, pool);
    req.key = key.to_vec();
    req.size = len;
    IoResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

fn put_release(h: &mut Harness, c: &TestClient, pool: u64, addr: u64) -> Status {
    let mut req = c.io_request(IoOp::PutRelease, pool);
    req.addr = addr;
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

fn get_locate(h: &mut Harness, c: &TestClient, pool: u64, key: &[u8]) -> IoResponse {
    let mut req = c.io_request(IoOp::GetLocate, pool);
    req.key = key.to_vec();
    IoResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

fn get_release(h: &mut Harness, c: &TestClient, pool: u64, addr: u64) -> Status {
    let mut req = c.io_request(IoOp::GetRelease, pool);
    req.addr = addr;
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

#[test]
fn test_direct_put_then_direct_get() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 2 << 20).pool_id;

    const LEN: u64 = 1 << 20;
    let resp = put_locate(&mut h, &c, pool, b"kbig", LEN);
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.data_len, LEN);
    assert_eq!(h.shard.locked_exclusive_count(), 1);
    assert_eq!(h.shard.pending_rename_count(), 1);

    // Client-side RDMA write into the located value.
    c.port.rdma_write(resp.addr, &vec![0x5a; LEN as usize], resp.key);
    assert_eq!(put_release(&mut h, &c, pool, resp.addr), Status::Ok);
    assert_eq!(h.shard.locked_exclusive_count(), 0);
    assert_eq!(h.shard.pending_rename_count(), 0);
    assert_eq!(c.port.registration_count(), 0);

    // The value now lives under the final key.
    let resp = get_locate(&mut h, &c, pool, b"kbig");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.data_len, LEN);
    let bytes = c.port.rdma_read(resp.addr, LEN, resp.key);
    assert!(bytes.iter().all(|&b| b == 0x5a));
    assert_eq!(get_release(&mut h, &c, pool, resp.addr), Status::Ok);
    assert_eq!(h.shard.locked_shared_count(), 0);
    assert_eq!(c.port.registration_count(), 0);

    // The provisional key is gone.
    let (status, _) = get(&mut h, &c, pool, b"___pending_kbig");
    assert_eq!(status, Status::KeyNotFound);
}

#[test]
fn test_direct_put_rejects_dont_stomp() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    let mut req = c.io_request(IoOp::PutLocate, pool);
    req.key = b"k".to_vec();
    req.size = 64;
    req.flags = IoFlags::DONT_STOMP;
    let resp = IoResponse::decode(&h.roundtrip(&c, req.encode())).unwrap();
    assert_eq!(resp.status, Status::Inval);
    assert_eq!(h.shard.locked_exclusive_count(), 0);
}

#[test]
fn test_put_advance_requires_matching_length() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    // A fresh advance creates the provisional entry at the stated length.
    let mut req = c.io_request(IoOp::PutAdvance, pool);
    req.key = b"k".to_vec();
    req.size = 64;
    let resp = IoResponse::decode(&h.roundtrip(&c, req.encode())).unwrap();
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.data_len, 64);
    assert_eq!(put_release(&mut h, &c, pool, resp.addr), Status::Ok);

    // A provisional entry left over from an interrupted transfer has 64
    // bytes; advancing the same key at a different length is refused.
    assert_eq!(
        put(&mut h, &c, pool, b"___pending_stale", &[0u8; 64]),
        Status::Ok
    );
    let mut req = c.io_request(IoOp::PutAdvance, pool);
    req.key = b"stale".to_vec();
    req.size = 32;
    let resp = IoResponse::decode(&h.roundtrip(&c, req.encode())).unwrap();
    assert_eq!(resp.status, Status::Inval);
    assert_eq!(h.shard.locked_exclusive_count(), 0);
    assert_eq!(h.shard.pending_rename_count(), 0);

    // At the matching length the leftover is adopted.
    let mut req = c.io_request(IoOp::PutAdvance, pool);
    req.key = b"stale".to_vec();
    req.size = 64;
    let resp = IoResponse::decode(&h.roundtrip(&c, req.encode())).unwrap();
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(put_release(&mut h, &c, pool, resp.addr), Status::Ok);
    let (status, _) = get(&mut h, &c, pool, b"stale");
    assert_eq!(status, Status::Ok);
}

#[test]
fn test_put_release_of_unknown_address_is_client_error() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    assert_eq!(put_release(&mut h, &c, pool, 0xdead_beef), Status::Inval);
    assert_eq!(get_release(&mut h, &c, pool, 0xdead_beef), Status::Inval);
}

#[test]
fn test_get_locate_missing_key() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    let resp = get_locate(&mut h, &c, pool, b"missing");
    assert_eq!(resp.status, Status::KeyNotFound);
    assert_eq!(h.shard.locked_shared_count(), 0);
}

#[test]
fn test_get_locate_release_is_idempotent_cycle() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    assert_eq!(put(&mut h, &c, pool, b"k", b"value"), Status::Ok);

    // Two locates pin the value twice; two releases fully unwind.
    let r1 = get_locate(&mut h, &c, pool, b"k");
    let r2 = get_locate(&mut h, &c, pool, b"k");
    assert_eq!(r1.addr, r2.addr);
    assert_eq!(h.shard.locked_shared_count(), 1);

    assert_eq!(get_release(&mut h, &c, pool, r1.addr), Status::Ok);
    assert_eq!(h.shard.locked_shared_count(), 1);
    assert_eq!(get_release(&mut h, &c, pool, r1.addr), Status::Ok);
    assert_eq!(h.shard.locked_shared_count(), 0);

    // Value untouched by the locate/release cycle.
    let (_, value) = get(&mut h, &c, pool, b"k");
    assert_eq!(value.as_deref(), Some(b"value".as_slice()));
}

#[test]
fn test_deferred_action_releases_exclusive_lock() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    let resp = put_locate(&mut h, &c, pool, b"k", 128);
    assert_eq!(resp.status, Status::Ok);
    c.port.rdma_write(resp.addr, &[1u8; 128], resp.key);

    // Release arrives as a deferred action instead of a protocol message.
    c.port.enqueue_action(Action {
        op: ACTION_RELEASE_VALUE_LOCK_EXCLUSIVE,
        arg: resp.addr,
    });
    h.tick(1);

    assert_eq!(h.shard.locked_exclusive_count(), 0);
    assert_eq!(h.shard.pending_rename_count(), 0);
    let (status, value) = get(&mut h, &c, pool, b"k");
    assert_eq!(status, Status::Ok);
    assert_eq!(value.as_deref(), Some(&[1u8; 128][..]));
}

#[test]
fn test_overwrite_via_direct_put() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    assert_eq!(put(&mut h, &c, pool, b"k", b"old-value"), Status::Ok);

    let resp = put_locate(&mut h, &c, pool, b"k", 4);
    assert_eq!(resp.status, Status::Ok);
    c.port.rdma_write(resp.addr, b"new!", resp.key);
    assert_eq!(put_release(&mut h, &c, pool, resp.addr), Status::Ok);

    let (_, value) = get(&mut h, &c, pool, b"k");
    assert_eq!(value.as_deref(), Some(b"new!".as_slice()));
}
