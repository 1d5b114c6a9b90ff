//! CSI Node Service Implementation
//!
//! Handles volume staging and publishing on Linux nodes: NVMe-oF fabric
//! connections, NFS mounts, filesystem formatting, bind mounts, and online
//! filesystem growth. All operations are serialized per volume handle and
//! written to be idempotent under kubelet retries.

use std::path::Path;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi;
use crate::metrics::RequestTimer;
use crate::platform;
use crate::volume::{FsType, Protocol, VolumeHandle, context_keys};
use crate::volume_lock::VolumeLocks;

/// How long to wait for a connected namespace device to appear in sysfs.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (connect to the NFS export or NVMe-oF subsystem,
///   format if needed, mount to the staging path)
/// - Volume unstaging (unmount, drop the fabric session when unused)
/// - Volume publishing (bind mount from staging to the pod target path)
/// - Volume unpublishing
/// - Online filesystem expansion and volume statistics
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    locks: VolumeLocks,
}

impl NodeService {
    /// Create a new NodeService with the specified node ID.
    pub fn new(node_id: String, locks: VolumeLocks) -> Self {
        Self { node_id, locks }
    }

    /// Validate that a path is safe to hand to mount tooling.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    fn parse_handle(volume_id: &str) -> Result<VolumeHandle, Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        VolumeHandle::parse(volume_id).map_err(|e| Status::invalid_argument(e.to_string()))
    }

    /// Whether the capability asks for a raw block volume.
    fn is_block_capability(capability: Option<&csi::VolumeCapability>) -> bool {
        capability.is_some_and(|cap| {
            matches!(
                cap.access_type,
                Some(csi::volume_capability::AccessType::Block(_))
            )
        })
    }

    /// Mount flags requested by the capability.
    fn capability_mount_flags(capability: Option<&csi::VolumeCapability>) -> Vec<String> {
        match capability.and_then(|cap| cap.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount.mount_flags.clone(),
            _ => vec![],
        }
    }

    /// Whether the access mode is read-only.
    fn is_readonly_capability(capability: Option<&csi::VolumeCapability>) -> bool {
        use csi::volume_capability::access_mode::Mode;
        capability
            .and_then(|cap| cap.access_mode.as_ref())
            .map(|m| {
                m.mode == Mode::SingleNodeReaderOnly as i32
                    || m.mode == Mode::MultiNodeReaderOnly as i32
            })
            .unwrap_or(false)
    }

    /// Filesystem type for a staged volume, from capability then handle.
    fn staged_fs_type(
        capability: Option<&csi::VolumeCapability>,
        handle: &VolumeHandle,
    ) -> Result<FsType, Status> {
        if let Some(csi::volume_capability::AccessType::Mount(mount)) =
            capability.and_then(|cap| cap.access_type.as_ref())
            && !mount.fs_type.is_empty()
        {
            return mount
                .fs_type
                .parse()
                .map_err(|e: crate::volume::FsTypeParseError| {
                    Status::invalid_argument(e.to_string())
                });
        }

        match handle.context_get(context_keys::FS_TYPE) {
            Some(fs) => fs
                .parse()
                .map_err(|e: crate::volume::FsTypeParseError| Status::internal(e.to_string())),
            None => Ok(FsType::default()),
        }
    }

    /// Connect the NVMe-oF subsystem of a handle and return the namespace
    /// device path.
    async fn attach_nvmeof_device(handle: &VolumeHandle) -> Result<String, Status> {
        let nqn = handle
            .context_get(context_keys::NQN)
            .ok_or_else(|| Status::invalid_argument("volume handle is missing the nqn"))?;
        let server = handle
            .context_get(context_keys::SERVER)
            .ok_or_else(|| Status::invalid_argument("volume handle is missing the server"))?;
        let port = handle
            .context_get(context_keys::PORT)
            .unwrap_or("4420");

        platform::connect_nvmeof(nqn, server, port).await?;
        platform::wait_for_nvmeof_device(
            nqn,
            handle.context_get(context_keys::NGUID),
            DEVICE_WAIT_TIMEOUT,
        )
        .await
    }

    async fn stage_volume_inner(
        &self,
        req: csi::NodeStageVolumeRequest,
    ) -> Result<csi::NodeStageVolumeResponse, Status> {
        let handle = Self::parse_handle(&req.volume_id)?;

        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            protocol = %handle.protocol,
            "NodeStageVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        let capability = req.volume_capability.as_ref();
        let block = Self::is_block_capability(capability);
        let mut options = Self::capability_mount_flags(capability);
        if Self::is_readonly_capability(capability) && !options.iter().any(|o| o == "ro") {
            options.push("ro".to_string());
        }

        match handle.protocol {
            Protocol::Nfs => {
                if block {
                    return Err(Status::invalid_argument(
                        "NFS volumes cannot be staged as raw block",
                    ));
                }

                if platform::is_mounted(&req.staging_target_path)? {
                    info!(staging_target_path = %req.staging_target_path, "Volume already staged");
                    return Ok(csi::NodeStageVolumeResponse {});
                }

                let server = handle
                    .context_get(context_keys::SERVER)
                    .ok_or_else(|| Status::invalid_argument("volume handle is missing the server"))?;
                let export = format!("{server}:/mnt/{}", handle.dataset);
                platform::mount_nfs(&export, &req.staging_target_path, &options).await?;
            }

            Protocol::Nvmeof => {
                let device = Self::attach_nvmeof_device(&handle).await?;

                if block {
                    // Raw block: the device is handed to the pod at publish
                    // time, nothing to mount here.
                    debug!(device = %device, "Block volume staged (device connected)");
                } else {
                    if platform::is_mounted(&req.staging_target_path)? {
                        info!(staging_target_path = %req.staging_target_path, "Volume already staged");
                        return Ok(csi::NodeStageVolumeResponse {});
                    }

                    let fs_type = Self::staged_fs_type(capability, &handle)?;

                    if platform::needs_formatting(&device).await? {
                        platform::format_device(&device, fs_type).await?;
                    } else if let Some(existing) = platform::detect_fs_type(&device).await?
                        && existing != fs_type.to_string()
                    {
                        return Err(Status::failed_precondition(format!(
                            "device {device} already carries {existing}, requested {fs_type}"
                        )));
                    }

                    platform::mount_device(&device, &req.staging_target_path, fs_type, &options)
                        .await?;
                }
            }

            Protocol::Iscsi => {
                return Err(Status::unimplemented(
                    "protocol=iscsi is not implemented yet",
                ));
            }
        }

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "Volume staged successfully"
        );

        Ok(csi::NodeStageVolumeResponse {})
    }

    async fn unstage_volume_inner(
        &self,
        req: csi::NodeUnstageVolumeRequest,
    ) -> Result<csi::NodeUnstageVolumeResponse, Status> {
        let handle = Self::parse_handle(&req.volume_id)?;

        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        platform::unmount(&req.staging_target_path).await?;

        // Drop the fabric session once the last namespace of the subsystem
        // is gone from this node.
        if handle.protocol == Protocol::Nvmeof
            && let Some(nqn) = handle.context_get(context_keys::NQN)
        {
            let _subsys_lock = self.locks.lock(&format!("subsys:{nqn}")).await;
            let remaining = platform::connected_namespace_count(nqn);
            if remaining <= 1 {
                platform::disconnect_nvmeof(nqn).await?;
            } else {
                debug!(
                    nqn = %nqn,
                    remaining,
                    "Subsystem still has namespaces in use, keeping connection"
                );
            }
        }

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "Volume unstaged successfully"
        );

        Ok(csi::NodeUnstageVolumeResponse {})
    }

    async fn publish_volume_inner(
        &self,
        req: csi::NodePublishVolumeRequest,
    ) -> Result<csi::NodePublishVolumeResponse, Status> {
        let handle = Self::parse_handle(&req.volume_id)?;

        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "Staging target path is required (STAGE_UNSTAGE_VOLUME capability is enabled)",
            ));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            target_path = %req.target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        if platform::is_mounted(&req.target_path)? {
            info!(target_path = %req.target_path, "Volume already published");
            return Ok(csi::NodePublishVolumeResponse {});
        }

        if Self::is_block_capability(req.volume_capability.as_ref()) {
            // Raw block: bind the namespace device node onto the target file.
            let device = Self::attach_nvmeof_device(&handle).await?;
            platform::ensure_file(&req.target_path)?;
            platform::bind_mount(&device, &req.target_path, req.readonly).await?;
        } else {
            if !platform::is_mounted(&req.staging_target_path)? {
                return Err(Status::failed_precondition(format!(
                    "Volume not staged at {}",
                    req.staging_target_path
                )));
            }

            platform::ensure_dir(&req.target_path)?;
            platform::bind_mount(&req.staging_target_path, &req.target_path, req.readonly).await?;
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume published successfully"
        );

        Ok(csi::NodePublishVolumeResponse {})
    }

    async fn unpublish_volume_inner(
        &self,
        req: csi::NodeUnpublishVolumeRequest,
    ) -> Result<csi::NodeUnpublishVolumeResponse, Status> {
        let handle = Self::parse_handle(&req.volume_id)?;

        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        platform::unmount(&req.target_path).await?;

        // Clean up the bind target; failure is non-fatal.
        let target = Path::new(&req.target_path);
        if target.exists() {
            let removed = if target.is_dir() {
                std::fs::remove_dir(target)
            } else {
                std::fs::remove_file(target)
            };
            if let Err(e) = removed {
                warn!(error = %e, target_path = %req.target_path, "Could not remove target path");
            }
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume unpublished successfully"
        );

        Ok(csi::NodeUnpublishVolumeResponse {})
    }

    async fn expand_volume_inner(
        &self,
        req: csi::NodeExpandVolumeRequest,
    ) -> Result<csi::NodeExpandVolumeResponse, Status> {
        let handle = Self::parse_handle(&req.volume_id)?;

        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        if Self::is_block_capability(req.volume_capability.as_ref()) {
            // Raw block devices grow with the backing ZVOL; nothing to do.
            let capacity_bytes = req
                .capacity_range
                .as_ref()
                .map(|r| r.required_bytes.max(r.limit_bytes))
                .unwrap_or(0);
            return Ok(csi::NodeExpandVolumeResponse { capacity_bytes });
        }

        match handle.protocol {
            Protocol::Nfs => {
                // Export growth is server-side; statfs already reflects it.
            }
            Protocol::Nvmeof => {
                let device = Self::attach_nvmeof_device(&handle).await?;
                let fs_type = Self::staged_fs_type(req.volume_capability.as_ref(), &handle)?;
                platform::expand_filesystem(&device, &req.volume_path, fs_type).await?;
            }
            Protocol::Iscsi => {
                return Err(Status::unimplemented(
                    "protocol=iscsi is not implemented yet",
                ));
            }
        }

        let (total, _, _) = platform::volume_stats(&req.volume_path).await?;

        info!(
            volume_id = %req.volume_id,
            capacity_bytes = total,
            "Volume expansion completed"
        );

        Ok(csi::NodeExpandVolumeResponse {
            capacity_bytes: total,
        })
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = RequestTimer::new("NodeStageVolume");
        let result = self.stage_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = RequestTimer::new("NodeUnstageVolume");
        let result = self.unstage_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Publish a volume to a target path (bind mount from staging).
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = RequestTimer::new("NodePublishVolume");
        let result = self.publish_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = RequestTimer::new("NodeUnpublishVolume");
        let result = self.unpublish_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::ExpandVolume,
            Type::GetVolumeStats,
        ]
        .into_iter()
        .map(|t| csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Expand a mounted filesystem to the size of its grown device.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = RequestTimer::new("NodeExpandVolume");
        let result = self.expand_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Get volume statistics for a mounted volume.
    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        if !Path::new(&req.volume_path).exists() {
            return Err(Status::not_found(format!(
                "volume path {} does not exist",
                req.volume_path
            )));
        }

        let (total, used, available) = platform::volume_stats(&req.volume_path).await?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![csi::VolumeUsage {
                available,
                total,
                used,
                unit: csi::volume_usage::Unit::Bytes as i32,
            }],
            volume_condition: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/kubelet/plugins/staging").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
        assert!(NodeService::validate_path("/a/b/c/d/e").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        // Empty path
        assert!(NodeService::validate_path("").is_err());

        // Relative path
        assert!(NodeService::validate_path("var/lib").is_err());

        // Path traversal
        assert!(NodeService::validate_path("/var/../etc").is_err());

        // Dangerous characters
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var|cat").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
    }

    #[test]
    fn test_parse_handle() {
        let handle = NodeService::parse_handle("nvmeof:tank/csi/vol1?server=192.0.2.10").unwrap();
        assert_eq!(handle.protocol, Protocol::Nvmeof);
        assert_eq!(handle.dataset, "tank/csi/vol1");

        assert!(NodeService::parse_handle("").is_err());
        assert!(NodeService::parse_handle("not-a-handle").is_err());
    }

    fn mount_capability(fs_type: &str, flags: &[&str], mode: i32) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: fs_type.to_string(),
                    mount_flags: flags.iter().map(|s| s.to_string()).collect(),
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode }),
        }
    }

    #[test]
    fn test_capability_helpers() {
        use csi::volume_capability::access_mode::Mode;

        let mount = mount_capability("xfs", &["noatime"], Mode::SingleNodeWriter as i32);
        assert!(!NodeService::is_block_capability(Some(&mount)));
        assert_eq!(
            NodeService::capability_mount_flags(Some(&mount)),
            vec!["noatime".to_string()]
        );
        assert!(!NodeService::is_readonly_capability(Some(&mount)));

        let readonly = mount_capability("ext4", &[], Mode::MultiNodeReaderOnly as i32);
        assert!(NodeService::is_readonly_capability(Some(&readonly)));

        let block = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        assert!(NodeService::is_block_capability(Some(&block)));
        assert!(NodeService::capability_mount_flags(Some(&block)).is_empty());
    }

    #[test]
    fn test_staged_fs_type_resolution() {
        use csi::volume_capability::access_mode::Mode;

        let handle = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/vol1")
            .with_context(context_keys::FS_TYPE, "btrfs");

        // Capability wins when it names a filesystem
        let cap = mount_capability("xfs", &[], Mode::SingleNodeWriter as i32);
        assert_eq!(
            NodeService::staged_fs_type(Some(&cap), &handle).unwrap(),
            FsType::Xfs
        );

        // Handle context is the fallback
        let cap = mount_capability("", &[], Mode::SingleNodeWriter as i32);
        assert_eq!(
            NodeService::staged_fs_type(Some(&cap), &handle).unwrap(),
            FsType::Btrfs
        );

        // Default when neither specifies
        let bare = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/vol2");
        assert_eq!(
            NodeService::staged_fs_type(None, &bare).unwrap(),
            FsType::Ext4
        );
    }

    #[test]
    fn test_node_service_creation() {
        let service = NodeService::new("test-node-1".to_string(), VolumeLocks::new());
        assert_eq!(service.node_id, "test-node-1");
    }
}
