//! Shard server daemon.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adoproto::paired::PairedAdoManager;
use adoproto::AdoManager;
use fabric::loopback::{LoopbackFabric, DEFAULT_IO_BUFFER_SIZE, DEFAULT_SEND_BUFFER_COUNT};
use kvapi::KvStore;
use shard::{BackendKind, ClusterSignalQueue, DaxRegistry, Shard, ShardConfig};

#[derive(Parser, Debug)]
#[command(name = "shardd", about = "Single-shard key-value server")]
struct Args {
    /// CPU core to pin the shard worker to.
    #[arg(long, default_value_t = 0)]
    core: usize,

    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    #[arg(long, default_value_t = 11911)]
    port: u16,

    /// Fabric provider; only `loopback` is compiled in.
    #[arg(long, default_value = "loopback")]
    provider: String,

    /// Per-session send-buffer pool depth.
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER_COUNT)]
    send_buffers: usize,

    /// Backend store: mapstore or filestore.
    #[arg(long, default_value = "mapstore")]
    backend: String,

    /// Backing directory for filestore pools.
    #[arg(long)]
    dax_path: Option<PathBuf>,

    /// ADO plugin to load (repeatable).
    #[arg(long = "ado-plugin")]
    ado_plugins: Vec<String>,

    /// ADO parameter as key=value (repeatable).
    #[arg(long = "ado-param", value_parser = parse_param)]
    ado_params: Vec<(String, String)>,

    #[arg(long)]
    ado_path: Option<PathBuf>,

    #[arg(long)]
    cert_path: Option<PathBuf>,

    /// Enable the in-process ADO host.
    #[arg(long)]
    enable_ado: bool,

    /// Exit once the last session closes.
    #[arg(long)]
    forced_exit: bool,

    #[arg(long, default_value_t = 0)]
    debug: u32,

    /// Drain and rebroadcast cluster signals.
    #[arg(long)]
    cluster_signals: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

static SIGINT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(flag) = SIGINT_FLAG.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn install_sigint(flag: Arc<AtomicBool>) {
    let _ = SIGINT_FLAG.set(flag);
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let backend_kind: BackendKind = args.backend.parse()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    install_sigint(shutdown.clone());

    let cluster = ClusterSignalQueue::new();
    let dax_registry = DaxRegistry::new();

    let backend: Box<dyn KvStore> = match backend_kind {
        BackendKind::MapStore => Box::new(mapstore::MapStore::new()),
        BackendKind::FileStore => {
            let dir = args
                .dax_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("./filestore-data"));
            if !dax_registry.claim(&dir) {
                return Err(format!("backing path {} already claimed", dir.display()).into());
            }
            Box::new(filestore::FileStore::new(dir)?)
        }
    };

    // Real RDMA providers are injected behind the same Listener contract;
    // only the in-process provider is compiled in here.
    let fabric = match args.provider.as_str() {
        "loopback" => LoopbackFabric::with_limits(args.send_buffers, DEFAULT_IO_BUFFER_SIZE),
        other => return Err(format!("unrecognized fabric provider ({other})").into()),
    };
    let listener = Box::new(fabric.listener());

    let ado_manager: Option<Box<dyn AdoManager>> = if args.enable_ado {
        let (manager, _hub) = PairedAdoManager::new();
        Some(Box::new(manager))
    } else {
        None
    };

    let config = ShardConfig {
        core: args.core,
        addr: args.addr,
        port: args.port,
        provider: args.provider,
        backend: backend_kind,
        dax_path: args.dax_path,
        ado_plugins: args.ado_plugins,
        ado_params: args.ado_params,
        ado_path: args.ado_path,
        cert_path: args.cert_path,
        forced_exit: args.forced_exit,
        debug_level: args.debug,
        cluster_signals_enabled: args.cluster_signals,
        send_buffer_count: args.send_buffers,
    };

    info!(
        core = config.core,
        provider = %config.provider,
        addr = %config.net_addr(),
        "starting shard"
    );
    let mut worker = Shard::new(config, backend, listener, ado_manager, cluster, shutdown);
    worker.run();
    Ok(())
}
