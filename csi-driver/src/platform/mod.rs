//! Platform abstraction for CSI Node operations
//!
//! Provides Linux-specific implementations for NVMe-oF device discovery,
//! NFS mounts, filesystem formatting and resizing, and bind mounts.

mod linux;

use tonic::Status;

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, Status>;

pub use linux::{
    bind_mount, connect_nvmeof, connected_namespace_count, detect_fs_type, disconnect_nvmeof,
    ensure_dir, ensure_file, expand_filesystem, format_device, is_mounted, is_nvmeof_connected,
    mount_device, mount_nfs, needs_formatting, unmount, volume_stats, wait_for_nvmeof_device,
};
