//! Test harness: a shard over loopback fabric and mapstore, driven tick by
//! tick from the test thread.
#![allow(dead_code)]

use std::cell::Cell;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use adoproto::paired::{EndpointHub, PairedAdoManager};
use fabric::loopback::{ClientPort, LoopbackFabric};
use kvapi::Status;
use kvwire::{
    AdoFlags, InfoRequest, InfoResponse, IoFlags, IoOp, IoRequest, IoResponse, PoolOp,
    PoolRequest, PoolResponse,
};
use shard::{Shard, ShardConfig};

pub struct Harness {
    pub shard: Shard,
    pub fabric: LoopbackFabric,
    pub hub: Option<EndpointHub>,
    pub shutdown: Arc<AtomicBool>,
    pub cluster: shard::ClusterSignalQueue,
}

pub struct HarnessOptions {
    pub region_cap: u64,
    pub with_ado: bool,
    pub send_buffer_count: usize,
    pub io_buffer_size: usize,
    pub forced_exit: bool,
    pub cluster_signals: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        HarnessOptions {
            region_cap: u64::MAX,
            with_ado: false,
            send_buffer_count: 8,
            io_buffer_size: 4096,
            forced_exit: false,
            cluster_signals: false,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_ado() -> Self {
        Self::with_options(HarnessOptions {
            with_ado: true,
            ..Default::default()
        })
    }

    pub fn with_options(opts: HarnessOptions) -> Self {
        let fabric = LoopbackFabric::with_limits(opts.send_buffer_count, opts.io_buffer_size);
        let listener = Box::new(fabric.listener());
        let backend = Box::new(mapstore::MapStore::with_region_cap(opts.region_cap));
        let (ado_manager, hub) = if opts.with_ado {
            let (manager, hub) = PairedAdoManager::new();
            (
                Some(Box::new(manager) as Box<dyn adoproto::AdoManager>),
                Some(hub),
            )
        } else {
            (None, None)
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let cluster = shard::ClusterSignalQueue::new();
        let config = ShardConfig {
            forced_exit: opts.forced_exit,
            cluster_signals_enabled: opts.cluster_signals,
            send_buffer_count: opts.send_buffer_count,
            ..Default::default()
        };
        let shard = Shard::new(
            config,
            backend,
            listener,
            ado_manager,
            cluster.clone(),
            shutdown.clone(),
        );
        Harness {
            shard,
            fabric,
            hub,
            shutdown,
            cluster,
        }
    }

    pub fn connect(&mut self) -> TestClient {
        let port = self.fabric.connect();
        self.shard.check_for_new_connections();
        TestClient {
            port,
            next_request: Cell::new(1),
        }
    }

    pub fn tick(&mut self, n: usize) {
        for _ in 0..n {
            self.shard.tick_once().expect("shard tick");
        }
    }

    /// Send one frame and tick until a response arrives.
    pub fn roundtrip(&mut self, client: &TestClient, frame: Vec<u8>) -> Vec<u8> {
        client.port.send(frame);
        for _ in 0..100 {
            self.shard.tick_once().expect("shard tick");
            if let Some(resp) = client.port.recv() {
                return resp;
            }
        }
        panic!("no response within 100 ticks");
    }
}

pub struct TestClient {
    pub port: ClientPort,
    next_request: Cell<u64>,
}

impl TestClient {
    pub fn request_id(&self) -> u64 {
        let id = self.next_request.get();
        self.next_request.set(id + 1);
        id
    }

    pub fn io_request(&self, op: IoOp, pool_id: u64) -> IoRequest {
        IoRequest {
            op,
            flags: IoFlags::empty(),
            pool_id,
            request_id: self.request_id(),
            addr: 0,
            offset: 0,
            size: 0,
            key: Vec::new(),
            value: Vec::new(),
        }
    }
}

// === Pool helpers ===

pub fn pool_create(h: &mut Harness, c: &TestClient, name: &str, size: u64) -> PoolResponse {
    let req = PoolRequest {
        op: PoolOp::Create,
        flags: 0,
        pool_id: 0,
        size,
        expected_count: 100,
        name: name.to_string(),
    };
    PoolResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

pub fn pool_open(h: &mut Harness, c: &TestClient, name: &str) -> PoolResponse {
    let req = PoolRequest {
        op: PoolOp::Open,
        flags: 0,
        pool_id: 0,
        size: 0,
        expected_count: 0,
        name: name.to_string(),
    };
    PoolResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

pub fn pool_close(h: &mut Harness, c: &TestClient, pool_id: u64) -> PoolResponse {
    let req = PoolRequest {
        op: PoolOp::Close,
        flags: 0,
        pool_id,
        size: 0,
        expected_count: 0,
        name: String::new(),
    };
    PoolResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

pub fn pool_delete_by_id(h: &mut Harness, c: &TestClient, pool_id: u64) -> PoolResponse {
    let req = PoolRequest {
        op: PoolOp::Delete,
        flags: 0,
        pool_id,
        size: 0,
        expected_count: 0,
        name: String::new(),
    };
    PoolResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

pub fn pool_delete_by_name(h: &mut Harness, c: &TestClient, name: &str) -> PoolResponse {
    let req = PoolRequest {
        op: PoolOp::Delete,
        flags: 0,
        pool_id: 0,
        size: 0,
        expected_count: 0,
        name: name.to_string(),
    };
    PoolResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

// === IO helpers ===

pub fn put(h: &mut Harness, c: &TestClient, pool: u64, key: &[u8], value: &[u8]) -> Status {
    put_flags(h, c, pool, key, value, IoFlags::empty())
}

pub fn put_flags(
    h: &mut Harness,
    c: &TestClient,
    pool: u64,
    key: &[u8],
    value: &[u8],
    flags: IoFlags,
) -> Status {
    let mut req = c.io_request(IoOp::Put, pool);
    req.flags = flags;
    req.key = key.to_vec();
    req.value = value.to_vec();
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

/// GET with a generous client-side capacity; handles both inline and
/// two-buffer responses. Returns the status and the value bytes if any.
pub fn get(h: &mut Harness, c: &TestClient, pool: u64, key: &[u8]) -> (Status, Option<Vec<u8>>) {
    let mut req = c.io_request(IoOp::Get, pool);
    req.key = key.to_vec();
    req.size = 1 << 20;
    let frame = h.roundtrip(c, req.encode());
    let (msg, trailer) = kvwire::split_frame(&frame).unwrap();
    let resp = IoResponse::decode(msg).unwrap();
    if !resp.status.is_ok() {
        return (resp.status, None);
    }
    if resp.data_len as usize == resp.data.len() {
        // Inline response (possibly empty).
        (resp.status, Some(resp.data))
    } else if !trailer.is_empty() {
        // Two-stage response: conclude with a GET_RELEASE.
        assert_eq!(trailer.len() as u64, resp.data_len);
        let value = trailer.to_vec();
        let mut rel = c.io_request(IoOp::GetRelease, pool);
        rel.addr = resp.addr;
        let rel_resp = IoResponse::decode(&h.roundtrip(c, rel.encode())).unwrap();
        assert_eq!(rel_resp.status, Status::Ok);
        (resp.status, Some(value))
    } else {
        (resp.status, None)
    }
}

pub fn erase(h: &mut Harness, c: &TestClient, pool: u64, key: &[u8]) -> Status {
    let mut req = c.io_request(IoOp::Erase, pool);
    req.key = key.to_vec();
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

pub fn configure(h: &mut Harness, c: &TestClient, pool: u64, command: &str) -> Status {
    let mut req = c.io_request(IoOp::Configure, pool);
    req.key = command.as_bytes().to_vec();
    IoResponse::decode(&h.roundtrip(c, req.encode()))
        .unwrap()
        .status
}

// === INFO helpers ===

pub fn info_attr(
    h: &mut Harness,
    c: &TestClient,
    pool: u64,
    attr: kvapi::Attribute,
    key: &[u8],
) -> InfoResponse {
    let req = InfoRequest {
        info_type: kvwire::InfoType::Attr(attr),
        pool_id: pool,
        offset: 0,
        key: key.to_vec(),
    };
    InfoResponse::decode(&h.roundtrip(c, req.encode())).unwrap()
}

// === ADO helpers ===

pub fn ado_request(
    c: &TestClient,
    pool: u64,
    key: &[u8],
    request: &[u8],
    flags: AdoFlags,
) -> kvwire::AdoRequest {
    kvwire::AdoRequest {
        flags,
        pool_id: pool,
        request_id: c.request_id(),
        ondemand_val_len: 0,
        key: key.to_vec(),
        request: request.to_vec(),
    }
}
