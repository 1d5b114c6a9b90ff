//! Driver configuration.
//!
//! All settings come from CLI flags with environment fallbacks so the same
//! binary runs as the controller Deployment and the node DaemonSet.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "TrueNAS CSI Driver for Kubernetes")]
pub struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    /// TrueNAS host name, or a full WebSocket URL
    #[arg(long, env = "TRUENAS_HOST")]
    pub truenas_host: String,

    /// TrueNAS API key
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    pub truenas_api_key: String,

    /// ZFS pool volumes are provisioned from
    #[arg(long, env = "TRUENAS_POOL")]
    pub truenas_pool: String,

    /// Parent dataset for volumes (defaults to `<pool>/csi`)
    #[arg(long, env = "TRUENAS_PARENT_DATASET")]
    pub parent_dataset: Option<String>,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Default NVMe-oF subsystem NQN when the storage class does not set one
    #[arg(long, env = "NVMEOF_SUBSYSTEM_NQN")]
    pub nvmeof_subsystem_nqn: Option<String>,

    /// Run in controller mode (enables controller service)
    #[arg(long, default_value = "false")]
    pub controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, default_value = "true")]
    pub node: bool,

    /// Backend keep-alive ping interval in seconds
    #[arg(long, default_value = "30")]
    pub ping_interval_secs: u64,

    /// Backend read deadline in seconds
    #[arg(long, default_value = "120")]
    pub read_deadline_secs: u64,

    /// Prometheus metrics listen address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// Driver name
    #[arg(long, default_value = "tns.csi.io")]
    pub driver_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// The WebSocket URL of the middleware API.
    pub fn socket_url(&self) -> String {
        if self.truenas_host.contains("://") {
            self.truenas_host.clone()
        } else {
            format!("wss://{}/api/current", self.truenas_host)
        }
    }

    /// The server address nodes mount NFS exports from (host part only).
    pub fn server_address(&self) -> String {
        match self.truenas_host.split_once("://") {
            Some((_, rest)) => rest
                .split(['/', ':'])
                .next()
                .unwrap_or(rest)
                .to_string(),
            None => self.truenas_host.clone(),
        }
    }

    /// Parent dataset all volumes are created under.
    pub fn parent_dataset(&self) -> String {
        self.parent_dataset
            .clone()
            .unwrap_or_else(|| format!("{}/csi", self.truenas_pool))
    }

    /// Filesystem path of the CSI UNIX socket.
    pub fn socket_path(&self) -> &str {
        self.endpoint
            .strip_prefix("unix://")
            .unwrap_or(&self.endpoint)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }
}
