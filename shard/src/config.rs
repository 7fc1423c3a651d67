//! Shard construction parameters.

use std::path::PathBuf;

use fabric::loopback::DEFAULT_SEND_BUFFER_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    MapStore,
    FileStore,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mapstore" => Ok(BackendKind::MapStore),
            "filestore" => Ok(BackendKind::FileStore),
            other => Err(format!("unrecognized backend ({other})")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// CPU core this shard pins to.
    pub core: usize,
    pub addr: String,
    pub port: u16,
    /// Fabric provider name; `loopback` is the in-process provider.
    pub provider: String,
    pub backend: BackendKind,
    /// Backing directory (filestore) or DAX path to claim.
    pub dax_path: Option<PathBuf>,
    pub ado_plugins: Vec<String>,
    pub ado_params: Vec<(String, String)>,
    pub ado_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    /// Exit once the last session closes.
    pub forced_exit: bool,
    pub debug_level: u32,
    /// Gate for draining the process-wide cluster-signal queue.
    pub cluster_signals_enabled: bool,
    /// Per-session send-buffer pool depth.
    pub send_buffer_count: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            core: 0,
            addr: "127.0.0.1".to_string(),
            port: 11911,
            provider: "loopback".to_string(),
            backend: BackendKind::MapStore,
            dax_path: None,
            ado_plugins: Vec::new(),
            ado_params: Vec::new(),
            ado_path: None,
            cert_path: None,
            forced_exit: false,
            debug_level: 0,
            cluster_signals_enabled: false,
            send_buffer_count: DEFAULT_SEND_BUFFER_COUNT,
        }
    }
}

impl ShardConfig {
    pub fn net_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}
