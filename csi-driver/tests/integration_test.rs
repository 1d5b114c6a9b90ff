//! Integration tests for csi-driver
//!
//! These tests verify the CSI service implementations without requiring a
//! TrueNAS backend or real mount operations: identity and node capability
//! reporting, volume handle round-trips, parameter parsing, and per-volume
//! locking behavior.

use std::collections::HashMap;
use std::time::Duration;

use tonic::Request;

use csi_driver::csi;
use csi_driver::csi::identity_server::Identity;
use csi_driver::csi::node_server::Node;
use csi_driver::detached;
use csi_driver::identity::{DRIVER_NAME, IdentityService};
use csi_driver::node::NodeService;
use csi_driver::volume::{FsType, Protocol, VolumeHandle, VolumeParameters, safe_component};
use csi_driver::volume_lock::VolumeLocks;

// ============================================================================
// Identity Service
// ============================================================================

#[tokio::test]
async fn test_plugin_info_reports_driver_name() {
    let service = IdentityService::new();
    let response = service
        .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.name, DRIVER_NAME);
    assert!(!response.vendor_version.is_empty());
    // CSI driver names follow DNS naming conventions
    assert!(
        response
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    );
}

#[tokio::test]
async fn test_plugin_advertises_controller_and_expansion() {
    let service = IdentityService::new();
    let response = service
        .get_plugin_capabilities(Request::new(csi::GetPluginCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();

    let mut has_controller = false;
    let mut has_online_expansion = false;
    for cap in response.capabilities {
        match cap.r#type {
            Some(csi::plugin_capability::Type::Service(s)) => {
                has_controller |=
                    s.r#type == csi::plugin_capability::service::Type::ControllerService as i32;
            }
            Some(csi::plugin_capability::Type::VolumeExpansion(e)) => {
                has_online_expansion |=
                    e.r#type == csi::plugin_capability::volume_expansion::Type::Online as i32;
            }
            None => {}
        }
    }

    assert!(has_controller);
    assert!(has_online_expansion);
}

// ============================================================================
// Node Service
// ============================================================================

#[tokio::test]
async fn test_node_capabilities() {
    let service = NodeService::new("node-1".to_string(), VolumeLocks::new());
    let response = service
        .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner();

    let types: Vec<i32> = response
        .capabilities
        .iter()
        .filter_map(|cap| match &cap.r#type {
            Some(csi::node_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();

    use csi::node_service_capability::rpc::Type;
    assert!(types.contains(&(Type::StageUnstageVolume as i32)));
    assert!(types.contains(&(Type::ExpandVolume as i32)));
    assert!(types.contains(&(Type::GetVolumeStats as i32)));
}

#[tokio::test]
async fn test_node_get_info() {
    let service = NodeService::new("worker-7".to_string(), VolumeLocks::new());
    let response = service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.node_id, "worker-7");
    assert_eq!(response.max_volumes_per_node, 0);
    assert!(response.accessible_topology.is_none());
}

#[tokio::test]
async fn test_node_stage_rejects_malformed_requests() {
    let service = NodeService::new("node-1".to_string(), VolumeLocks::new());

    // Empty volume id
    let response = service
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
            volume_id: String::new(),
            staging_target_path: "/var/lib/kubelet/staging/v".to_string(),
            ..Default::default()
        }))
        .await;
    assert_eq!(response.unwrap_err().code(), tonic::Code::InvalidArgument);

    // Missing staging path
    let response = service
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
            volume_id: "nfs:tank/csi/vol1?server=192.0.2.1".to_string(),
            staging_target_path: String::new(),
            ..Default::default()
        }))
        .await;
    assert_eq!(response.unwrap_err().code(), tonic::Code::InvalidArgument);

    // Path traversal in staging path
    let response = service
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
            volume_id: "nfs:tank/csi/vol1?server=192.0.2.1".to_string(),
            staging_target_path: "/var/../etc".to_string(),
            ..Default::default()
        }))
        .await;
    assert_eq!(response.unwrap_err().code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_node_stage_rejects_iscsi_handles() {
    let service = NodeService::new("node-1".to_string(), VolumeLocks::new());

    let response = service
        .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
            volume_id: "iscsi:tank/csi/vol1".to_string(),
            staging_target_path: "/var/lib/kubelet/staging/v".to_string(),
            ..Default::default()
        }))
        .await;

    assert_eq!(response.unwrap_err().code(), tonic::Code::Unimplemented);
}

// ============================================================================
// Volume handle round-trips
// ============================================================================

#[test]
fn test_handle_roundtrip_nfs() {
    let handle =
        VolumeHandle::new(Protocol::Nfs, "tank/csi/basic").with_context("server", "nas.example.net");

    let parsed = VolumeHandle::parse(&handle.encode()).unwrap();
    assert_eq!(parsed, handle);
}

#[test]
fn test_handle_roundtrip_nvmeof_full_context() {
    let handle = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/block-vol")
        .with_context("server", "192.0.2.10")
        .with_context("port", "4420")
        .with_context("nqn", "nqn.2005-03.org.truenas:csi-test")
        .with_context("nguid", "6e3a4c5d6f708192a3b4c5d6e7f80910")
        .with_context("nsid", "1")
        .with_context("fsType", "btrfs");

    let encoded = handle.encode();
    let parsed = VolumeHandle::parse(&encoded).unwrap();

    assert_eq!(parsed, handle);
    assert_eq!(parsed.encode(), encoded);
}

// ============================================================================
// Storage-class parameters
// ============================================================================

#[test]
fn test_full_parameter_set() {
    let mut params = HashMap::new();
    params.insert("protocol".to_string(), "nvmeof".to_string());
    params.insert("pool".to_string(), "tank".to_string());
    params.insert("server".to_string(), "192.0.2.10".to_string());
    params.insert("transport".to_string(), "tcp".to_string());
    params.insert("port".to_string(), "4420".to_string());
    params.insert(
        "subsystemNQN".to_string(),
        "nqn.2005-03.org.truenas:csi-test".to_string(),
    );
    params.insert("fsType".to_string(), "xfs".to_string());
    params.insert("parentDataset".to_string(), "tank/k8s".to_string());
    params.insert("detachedSnapshots".to_string(), "true".to_string());
    params.insert("zfs.recordsize".to_string(), "128K".to_string());
    params.insert("zfs.dedup".to_string(), "off".to_string());

    let parsed = VolumeParameters::from_map(&params).unwrap();

    assert_eq!(parsed.protocol, Protocol::Nvmeof);
    assert_eq!(parsed.pool.as_deref(), Some("tank"));
    assert_eq!(parsed.parent_dataset.as_deref(), Some("tank/k8s"));
    assert_eq!(parsed.fs_type, FsType::Xfs);
    assert!(parsed.detached_snapshots);
    assert_eq!(parsed.zfs_properties.len(), 2);
}

#[test]
fn test_safe_component_is_stable_for_orchestrator_names() {
    // Typical PVC-derived names pass through unchanged
    let name = "pvc-8f14e45f-ceea-467f-9b5d-2c9e1f6b0a3c";
    assert_eq!(safe_component(name), name);
}

// ============================================================================
// Detached snapshot identifiers
// ============================================================================

#[test]
fn test_detached_snapshot_ids() {
    let id = detached::detached_dataset("tank/csi", "snap-backup-1");
    assert_eq!(id, "tank/csi/snapshots/snap-backup-1");
    assert!(detached::is_detached_id(&id));
    assert!(!detached::is_detached_id("tank/csi/vol1@snap-backup-1"));
}

// ============================================================================
// Per-volume locking
// ============================================================================

#[tokio::test]
async fn test_volume_lock_contention() {
    let locks = VolumeLocks::new();

    let guard = locks.lock("nfs:tank/csi/contended").await;

    let locks2 = locks.clone();
    let waiter = tokio::spawn(async move {
        let _guard = locks2.lock("nfs:tank/csi/contended").await;
    });

    // The second acquisition must block while the first guard is held.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should acquire after release")
        .unwrap();
}
