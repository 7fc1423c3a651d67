//! Pool lifecycle: create/open/close/delete, reference counting, and
//! session teardown.

mod common;

use common::*;
use kvapi::{Attribute, Status};

#[test]
fn test_pool_refcount_open_twice_close_twice() {
    let mut h = Harness::new();
    let c = h.connect();

    let created = pool_create(&mut h, &c, "p", 1 << 20);
    assert_eq!(created.status, Status::Ok);
    let pool = created.pool_id;

    // Second open in the same session bumps the session refcount and hands
    // back the same id.
    let opened = pool_open(&mut h, &c, "p");
    assert_eq!(opened.status, Status::Ok);
    assert_eq!(opened.pool_id, pool);

    // One close: pool stays open, attributes still answer.
    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert!(h.shard.backend().is_pool_open(pool));
    let count = info_attr(&mut h, &c, pool, Attribute::Count, b"");
    assert_eq!(count.status, Status::Ok);

    // Second close: pool is really closed.
    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert!(!h.shard.backend().is_pool_open(pool));
    let count = info_attr(&mut h, &c, pool, Attribute::Count, b"");
    assert_eq!(count.status, Status::PoolError);
}

#[test]
fn test_close_unknown_pool_is_inval() {
    let mut h = Harness::new();
    let c = h.connect();
    assert_eq!(pool_close(&mut h, &c, 999).status, Status::Inval);
}

#[test]
fn test_two_sessions_share_one_pool() {
    let mut h = Harness::new();
    let c1 = h.connect();
    let c2 = h.connect();

    let p1 = pool_create(&mut h, &c1, "shared", 1 << 20).pool_id;
    let p2 = pool_open(&mut h, &c2, "shared").pool_id;
    assert_eq!(p1, p2);

    assert_eq!(put(&mut h, &c1, p1, b"k", b"from-1"), Status::Ok);
    let (status, value) = get(&mut h, &c2, p2, b"k");
    assert_eq!(status, Status::Ok);
    assert_eq!(value.as_deref(), Some(b"from-1".as_slice()));

    // Session 1 closing its reference leaves the pool open for session 2.
    assert_eq!(pool_close(&mut h, &c1, p1).status, Status::Ok);
    assert!(h.shard.backend().is_pool_open(p2));
    let (status, _) = get(&mut h, &c2, p2, b"k");
    assert_eq!(status, Status::Ok);

    assert_eq!(pool_close(&mut h, &c2, p2).status, Status::Ok);
    assert!(!h.shard.backend().is_pool_open(p2));
}

#[test]
fn test_delete_by_name_refused_while_open() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;

    assert_eq!(
        pool_delete_by_name(&mut h, &c, "p").status,
        Status::AlreadyOpen
    );

    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert_eq!(pool_delete_by_name(&mut h, &c, "p").status, Status::Ok);
    // Gone for good.
    assert_eq!(pool_open(&mut h, &c, "p").status, Status::Inval);
}

#[test]
fn test_delete_by_id_with_extra_references_is_busy() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    pool_open(&mut h, &c, "p");

    assert_eq!(pool_delete_by_id(&mut h, &c, pool).status, Status::Busy);

    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert_eq!(pool_delete_by_id(&mut h, &c, pool).status, Status::Ok);
    assert!(!h.shard.backend().is_pool_open(pool));
    assert_eq!(pool_open(&mut h, &c, "p").status, Status::Inval);
}

#[test]
fn test_create_existing_pool_reuses_reference() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    // A second create in the same session behaves like open.
    let again = pool_create(&mut h, &c, "p", 1 << 20);
    assert_eq!(again.status, Status::Ok);
    assert_eq!(again.pool_id, pool);

    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert!(h.shard.backend().is_pool_open(pool));
    assert_eq!(pool_close(&mut h, &c, pool).status, Status::Ok);
    assert!(!h.shard.backend().is_pool_open(pool));
}

#[test]
fn test_session_close_releases_pools() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    assert_eq!(put(&mut h, &c, pool, b"k", b"v"), Status::Ok);
    assert_eq!(h.shard.session_count(), 1);

    drop(c);
    h.tick(3);
    assert_eq!(h.shard.session_count(), 0);
    assert!(!h.shard.backend().is_pool_open(pool));
}

#[test]
fn test_forced_exit_after_last_session() {
    let mut h = Harness::with_options(HarnessOptions {
        forced_exit: true,
        ..Default::default()
    });
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    assert_eq!(put(&mut h, &c, pool, b"k", b"v"), Status::Ok);
    assert!(!h.shard.exited());

    drop(c);
    h.tick(3);
    assert_eq!(h.shard.session_count(), 0);
    assert!(h.shard.exited());
}

#[test]
fn test_shutdown_flag_closes_sessions() {
    let mut h = Harness::new();
    let c = h.connect();
    let pool = pool_create(&mut h, &c, "p", 1 << 20).pool_id;
    assert_eq!(put(&mut h, &c, pool, b"k", b"v"), Status::Ok);

    h.shutdown
        .store(true, std::sync::atomic::Ordering::Relaxed);
    h.tick(2);
    assert!(h.shard.exited());
    assert_eq!(h.shard.session_count(), 0);
    assert!(!h.shard.backend().is_pool_open(pool));
}
