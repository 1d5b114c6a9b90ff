//! TrueNAS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions storage from a TrueNAS appliance
//! over its WebSocket JSON-RPC API and attaches it to worker nodes via NFS
//! or NVMe-oF/TCP.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Volume handle encoding and storage-class parameter parsing
//! - Per-volume locking for lifecycle serialization
//! - Detached (send/receive) snapshot orchestration
//! - Platform-specific device discovery, format, mount, and resize operations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod config;
pub mod controller;
pub mod detached;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod volume;
pub mod volume_lock;

pub use config::Args;
pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
pub use volume_lock::VolumeLocks;
