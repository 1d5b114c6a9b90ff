//! CSI Controller Service Implementation
//!
//! Handles volume and snapshot lifecycle operations against the TrueNAS
//! backend. Every mutating RPC is serialized per volume handle and written
//! to converge under orchestrator retries.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use prost_types::Timestamp;
use serde_json::{Map, Value, json};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tnas_client::types::DatasetKind;
use tnas_client::{ClientError, RpcError, TruenasClient};

use crate::csi;
use crate::detached;
use crate::metrics::{self, RequestTimer};
use crate::volume::{
    FsType, Protocol, VolumeHandle, VolumeParameters, context_keys, safe_component,
};
use crate::volume_lock::VolumeLocks;

/// Default volume size: 1GB
const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Driver-level defaults resolved from configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Default pool when the storage class does not name one.
    pub pool: String,
    /// Parent dataset all volumes are created under.
    pub parent_dataset: String,
    /// Address nodes reach the appliance at (NFS exports, NVMe-oF portal).
    pub server: String,
    /// Default NVMe-oF subsystem NQN.
    pub default_subsystem_nqn: Option<String>,
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion, and expansion
/// - Snapshot creation and deletion (native and detached)
/// - Volume and snapshot listing, capacity, capability reporting
pub struct ControllerService {
    client: TruenasClient,
    locks: VolumeLocks,
    config: ControllerConfig,
}

impl ControllerService {
    pub fn new(client: TruenasClient, locks: VolumeLocks, config: ControllerConfig) -> Self {
        Self {
            client,
            locks,
            config,
        }
    }

    /// Get required volume size from capacity range.
    fn get_volume_size(capacity_range: Option<&csi::CapacityRange>) -> i64 {
        capacity_range
            .map(|range| {
                if range.required_bytes > 0 {
                    range.required_bytes
                } else if range.limit_bytes > 0 {
                    range.limit_bytes
                } else {
                    DEFAULT_VOLUME_SIZE
                }
            })
            .unwrap_or(DEFAULT_VOLUME_SIZE)
    }

    /// Whether the requested capabilities ask for a raw block volume.
    fn wants_block(capabilities: &[csi::VolumeCapability]) -> Result<bool, Status> {
        let mut block = false;
        let mut mount = false;
        for cap in capabilities {
            match cap.access_type {
                Some(csi::volume_capability::AccessType::Block(_)) => block = true,
                Some(csi::volume_capability::AccessType::Mount(_)) => mount = true,
                None => {}
            }
        }
        if block && mount {
            return Err(Status::invalid_argument(
                "volume cannot be both raw block and mounted filesystem",
            ));
        }
        Ok(block)
    }

    /// Filesystem type requested via capability, falling back to parameters.
    fn requested_fs_type(
        capabilities: &[csi::VolumeCapability],
        params: &VolumeParameters,
    ) -> Result<FsType, Status> {
        for cap in capabilities {
            if let Some(csi::volume_capability::AccessType::Mount(mount)) = &cap.access_type
                && !mount.fs_type.is_empty()
            {
                return mount
                    .fs_type
                    .parse()
                    .map_err(|e: crate::volume::FsTypeParseError| {
                        Status::invalid_argument(e.to_string())
                    });
            }
        }
        Ok(params.fs_type)
    }

    fn now_timestamp() -> Timestamp {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Timestamp { seconds, nanos: 0 }
    }

    /// Build the CSI volume response from a handle.
    fn handle_to_volume(
        handle: &VolumeHandle,
        capacity_bytes: i64,
        content_source: Option<csi::VolumeContentSource>,
    ) -> csi::Volume {
        let mut volume_context: HashMap<String, String> = HashMap::new();
        for (k, v) in &handle.context {
            volume_context.insert(k.clone(), v.clone());
        }
        volume_context.insert("protocol".to_string(), handle.protocol.to_string());
        volume_context.insert("dataset".to_string(), handle.dataset.clone());

        csi::Volume {
            capacity_bytes,
            volume_id: handle.encode(),
            volume_context,
            content_source,
            accessible_topology: vec![],
        }
    }

    /// Materialize the dataset for a volume created from a content source.
    ///
    /// Idempotent: an already-present target is left untouched so retries
    /// converge.
    async fn materialize_from_source(
        &self,
        source: &csi::VolumeContentSource,
        target: &str,
        params: &VolumeParameters,
    ) -> Result<(), Status> {
        if self.client.dataset_get(target).await.is_ok() {
            debug!(target = %target, "Content-source target already materialized");
            return Ok(());
        }

        match &source.r#type {
            Some(csi::volume_content_source::Type::Snapshot(snap)) => {
                if snap.snapshot_id.is_empty() {
                    return Err(Status::invalid_argument("snapshot_id is required"));
                }

                if detached::is_detached_id(&snap.snapshot_id) {
                    self.client
                        .dataset_get(&snap.snapshot_id)
                        .await
                        .map_err(|e| match e {
                            ClientError::NotFound(_) => Status::not_found(format!(
                                "detached snapshot '{}' not found",
                                snap.snapshot_id
                            )),
                            other => status_from_client(other),
                        })?;
                    detached::restore(&self.client, &snap.snapshot_id, target)
                        .await
                        .map_err(status_from_client)?;
                } else {
                    self.client
                        .snapshot_get(&snap.snapshot_id)
                        .await
                        .map_err(status_from_client)?
                        .ok_or_else(|| {
                            Status::not_found(format!("snapshot '{}' not found", snap.snapshot_id))
                        })?;
                    self.client
                        .clone_create(&snap.snapshot_id, target)
                        .await
                        .map_err(status_from_client)?;
                }
            }
            Some(csi::volume_content_source::Type::Volume(vol)) => {
                let source_handle = VolumeHandle::parse(&vol.volume_id)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;

                let transient = format!("csi-clone-{}", Uuid::new_v4().simple());
                self.client
                    .snapshot_create(&source_handle.dataset, &transient)
                    .await
                    .map_err(status_from_client)?;
                let snap_id = format!("{}@{}", source_handle.dataset, transient);

                if params.detached_snapshots {
                    // Full copy: the new volume carries no link to the source.
                    let result = self.client.send_receive(&snap_id, target).await;
                    if let Err(e) = self.client.snapshot_delete(&snap_id).await {
                        warn!(snapshot = %snap_id, error = %e, "Transient snapshot cleanup failed");
                    }
                    result.map_err(status_from_client)?;
                } else {
                    // Linked clone; the transient snapshot is its origin and
                    // stays until the source is destroyed (deletion deferred).
                    self.client
                        .clone_create(&snap_id, target)
                        .await
                        .map_err(status_from_client)?;
                }
            }
            None => {
                return Err(Status::invalid_argument(
                    "volume_content_source has no source type",
                ));
            }
        }

        Ok(())
    }

    async fn create_volume_inner(
        &self,
        req: csi::CreateVolumeRequest,
    ) -> Result<csi::CreateVolumeResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Volume name is required"));
        }

        let params = VolumeParameters::from_map(&req.parameters)
            .map_err(Status::invalid_argument)?;
        let capacity = Self::get_volume_size(req.capacity_range.as_ref());
        let block = Self::wants_block(&req.volume_capabilities)?;
        let fs_type = Self::requested_fs_type(&req.volume_capabilities, &params)?;

        if block && params.protocol == Protocol::Nfs {
            return Err(Status::invalid_argument(
                "raw block volumes require protocol=nvmeof",
            ));
        }

        let parent = params
            .parent_dataset
            .clone()
            .unwrap_or_else(|| self.config.parent_dataset.clone());
        let dataset = format!("{parent}/{}", safe_component(&req.name));

        info!(
            name = %req.name,
            dataset = %dataset,
            protocol = %params.protocol,
            capacity_bytes = capacity,
            "CreateVolume request"
        );

        let _lock = self.locks.lock(&dataset).await;

        let result = self
            .provision(&req, &params, &dataset, capacity, block, fs_type)
            .await;

        metrics::record_volume_operation(
            "create",
            &params.protocol.to_string(),
            match &result {
                Ok(_) => "ok",
                Err(status) => metrics::code_label(status.code()),
            },
        );

        let (handle, capacity_bytes) = result?;

        info!(
            volume_id = %handle.encode(),
            capacity_bytes,
            "Volume created successfully"
        );

        Ok(csi::CreateVolumeResponse {
            volume: Some(Self::handle_to_volume(
                &handle,
                capacity_bytes,
                req.volume_content_source,
            )),
        })
    }

    /// Create or adopt the backend objects for one volume.
    async fn provision(
        &self,
        req: &csi::CreateVolumeRequest,
        params: &VolumeParameters,
        dataset: &str,
        capacity: i64,
        block: bool,
        fs_type: FsType,
    ) -> Result<(VolumeHandle, i64), Status> {
        let server = params
            .server
            .clone()
            .unwrap_or_else(|| self.config.server.clone());

        match params.protocol {
            Protocol::Nfs => {
                let ds = match &req.volume_content_source {
                    None => {
                        let mut props = params.zfs_properties.clone();
                        props.insert("refquota".to_string(), json!(capacity));
                        let ds = self
                            .client
                            .dataset_ensure(dataset, &props)
                            .await
                            .map_err(status_from_client)?;
                        // refquota may be absent from a create reply; only a
                        // pre-existing dataset with a different quota is a
                        // conflict.
                        if ds.capacity_bytes() != 0 && ds.capacity_bytes() != capacity as u64 {
                            return Err(Status::already_exists(format!(
                                "volume '{}' exists with capacity {} (requested {})",
                                req.name,
                                ds.capacity_bytes(),
                                capacity
                            )));
                        }
                        ds
                    }
                    Some(source) => {
                        self.materialize_from_source(source, dataset, params).await?;
                        self.apply_post_copy_properties(dataset, params).await?;
                        self.client
                            .dataset_set_refquota(dataset, capacity as u64)
                            .await
                            .map_err(status_from_client)?;
                        self.client
                            .dataset_get(dataset)
                            .await
                            .map_err(status_from_client)?
                    }
                };

                if ds.kind != DatasetKind::Filesystem {
                    return Err(Status::already_exists(format!(
                        "'{dataset}' exists but is not a filesystem dataset"
                    )));
                }

                self.client
                    .nfs_share_ensure(dataset, &[])
                    .await
                    .map_err(status_from_client)?;

                let handle = VolumeHandle::new(Protocol::Nfs, dataset)
                    .with_context(context_keys::SERVER, &server);
                let reported = if ds.capacity_bytes() == 0 {
                    capacity
                } else {
                    ds.capacity_bytes() as i64
                };
                Ok((handle, reported))
            }

            Protocol::Nvmeof => {
                let nqn = params
                    .subsystem_nqn
                    .clone()
                    .or_else(|| self.config.default_subsystem_nqn.clone())
                    .ok_or_else(|| {
                        Status::invalid_argument(
                            "subsystemNQN is required for protocol=nvmeof",
                        )
                    })?;
                let port = params.port.unwrap_or(Protocol::Nvmeof.default_port());

                let ds = match &req.volume_content_source {
                    None => {
                        let ds = self
                            .client
                            .zvol_ensure(dataset, capacity as u64, &params.zfs_properties)
                            .await
                            .map_err(status_from_client)?;
                        ds
                    }
                    Some(source) => {
                        self.materialize_from_source(source, dataset, params).await?;
                        self.apply_post_copy_properties(dataset, params).await?;
                        let ds = self
                            .client
                            .dataset_get(dataset)
                            .await
                            .map_err(status_from_client)?;
                        // A copy inherits the source size; grow it if the
                        // request asks for more.
                        if ds.capacity_bytes() < capacity as u64 {
                            self.client
                                .zvol_resize(dataset, capacity as u64)
                                .await
                                .map_err(status_from_client)?;
                            self.client
                                .dataset_get(dataset)
                                .await
                                .map_err(status_from_client)?
                        } else {
                            ds
                        }
                    }
                };

                if ds.kind != DatasetKind::Volume {
                    return Err(Status::already_exists(format!(
                        "'{dataset}' exists but is not a ZVOL"
                    )));
                }

                let namespace = self
                    .client
                    .nvmeof_namespace_attach(&nqn, dataset)
                    .await
                    .map_err(status_from_client)?;

                let mut handle = VolumeHandle::new(Protocol::Nvmeof, dataset)
                    .with_context(context_keys::SERVER, &server)
                    .with_context(context_keys::PORT, port.to_string())
                    .with_context(context_keys::NQN, &nqn);
                if let Some(nguid) = namespace.device_nguid.or(namespace.device_uuid) {
                    handle = handle.with_context(context_keys::NGUID, nguid);
                }
                if let Some(nsid) = namespace.nsid {
                    handle = handle.with_context(context_keys::NSID, nsid.to_string());
                }
                if !block {
                    handle = handle.with_context(context_keys::FS_TYPE, fs_type.to_string());
                }

                Ok((handle, ds.capacity_bytes() as i64))
            }

            Protocol::Iscsi => Err(Status::unimplemented(
                "protocol=iscsi is not implemented yet",
            )),
        }
    }

    /// Apply `zfs.*` overrides after a clone/receive created the dataset.
    async fn apply_post_copy_properties(
        &self,
        dataset: &str,
        params: &VolumeParameters,
    ) -> Result<(), Status> {
        // volblocksize is create-time only; a received/cloned ZVOL keeps the
        // source's value.
        let mut props: Map<String, Value> = params.zfs_properties.clone();
        props.remove("volblocksize");
        self.client
            .dataset_update(dataset, &props)
            .await
            .map_err(status_from_client)
    }

    async fn delete_volume_inner(
        &self,
        req: csi::DeleteVolumeRequest,
    ) -> Result<csi::DeleteVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let handle = VolumeHandle::parse(&req.volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(volume_id = %req.volume_id, dataset = %handle.dataset, "DeleteVolume request");

        let _lock = self.locks.lock(&handle.dataset).await;

        let result = self.deprovision(&handle).await;

        metrics::record_volume_operation(
            "delete",
            &handle.protocol.to_string(),
            match &result {
                Ok(_) => "ok",
                Err(status) => metrics::code_label(status.code()),
            },
        );
        result?;

        info!(volume_id = %req.volume_id, "Volume deleted successfully");
        Ok(csi::DeleteVolumeResponse {})
    }

    /// Tear down the export and backend object of one volume. Every step
    /// treats absence as success so retries converge.
    async fn deprovision(&self, handle: &VolumeHandle) -> Result<(), Status> {
        match handle.protocol {
            Protocol::Nfs => {
                self.client
                    .nfs_share_delete(&handle.dataset)
                    .await
                    .map_err(status_from_client)?;
            }
            Protocol::Nvmeof => {
                if let Some(namespace) = self
                    .client
                    .nvmeof_namespace_for_zvol(&handle.dataset)
                    .await
                    .map_err(status_from_client)?
                {
                    self.client
                        .nvmeof_namespace_delete(namespace.id)
                        .await
                        .map_err(status_from_client)?;
                }
            }
            Protocol::Iscsi => {
                return Err(Status::unimplemented(
                    "protocol=iscsi is not implemented yet",
                ));
            }
        }

        self.client
            .dataset_delete(&handle.dataset, true)
            .await
            .map_err(status_from_client)
    }

    async fn expand_volume_inner(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let capacity_range = req.capacity_range.as_ref().ok_or_else(|| {
            Status::invalid_argument("Capacity range is required for volume expansion")
        })?;

        let new_size_bytes = if capacity_range.required_bytes > 0 {
            capacity_range.required_bytes
        } else {
            capacity_range.limit_bytes
        };

        if new_size_bytes <= 0 {
            return Err(Status::invalid_argument(
                "Required or limit bytes must be positive",
            ));
        }

        let handle = VolumeHandle::parse(&req.volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(
            volume_id = %req.volume_id,
            new_size_bytes,
            "ControllerExpandVolume request"
        );

        let _lock = self.locks.lock(&handle.dataset).await;

        let block = req
            .volume_capability
            .as_ref()
            .is_some_and(|cap| {
                matches!(
                    cap.access_type,
                    Some(csi::volume_capability::AccessType::Block(_))
                )
            });

        let result: Result<i64, Status> = match handle.protocol {
            Protocol::Nfs => {
                let ds = self
                    .client
                    .dataset_get(&handle.dataset)
                    .await
                    .map_err(status_from_client)?;
                let current = ds.capacity_bytes();
                if (new_size_bytes as u64) < current {
                    Err(Status::invalid_argument(format!(
                        "requested size {new_size_bytes} is below current capacity {current}"
                    )))
                } else {
                    if new_size_bytes as u64 > current {
                        self.client
                            .dataset_set_refquota(&handle.dataset, new_size_bytes as u64)
                            .await
                            .map_err(status_from_client)?;
                    }
                    Ok(new_size_bytes)
                }
            }
            Protocol::Nvmeof => self
                .client
                .zvol_resize(&handle.dataset, new_size_bytes as u64)
                .await
                .map(|actual| actual as i64)
                .map_err(status_from_client),
            Protocol::Iscsi => Err(Status::unimplemented(
                "protocol=iscsi is not implemented yet",
            )),
        };

        metrics::record_volume_operation(
            "expand",
            &handle.protocol.to_string(),
            match &result {
                Ok(_) => "ok",
                Err(status) => metrics::code_label(status.code()),
            },
        );
        let actual_size = result?;

        info!(volume_id = %req.volume_id, actual_size, "Volume expanded successfully");

        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes: actual_size,
            node_expansion_required: !block,
        })
    }

    async fn create_snapshot_inner(
        &self,
        req: csi::CreateSnapshotRequest,
    ) -> Result<csi::CreateSnapshotResponse, Status> {
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("Source volume ID is required"));
        }
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Snapshot name is required"));
        }

        let params = VolumeParameters::from_map(&req.parameters)
            .map_err(Status::invalid_argument)?;
        let source = VolumeHandle::parse(&req.source_volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let component = safe_component(&req.name);

        info!(
            source_volume_id = %req.source_volume_id,
            name = %req.name,
            detached = params.detached_snapshots,
            "CreateSnapshot request"
        );

        let _lock = self.locks.lock(&source.dataset).await;

        let source_capacity = self
            .client
            .dataset_get(&source.dataset)
            .await
            .map_err(|e| match e {
                ClientError::NotFound(_) => Status::not_found(format!(
                    "source volume '{}' not found",
                    req.source_volume_id
                )),
                other => status_from_client(other),
            })?
            .capacity_bytes() as i64;

        let mode = if params.detached_snapshots {
            "detached"
        } else {
            "native"
        };

        let snapshot = if params.detached_snapshots {
            let parent = params
                .parent_dataset
                .clone()
                .unwrap_or_else(|| self.config.parent_dataset.clone());
            let result =
                detached::create(&self.client, &parent, &source.dataset, &component).await;
            metrics::record_volume_operation(
                "snapshot_create",
                &source.protocol.to_string(),
                if result.is_ok() { "ok" } else { "internal" },
            );
            let destination = result.map_err(status_from_client)?;

            csi::Snapshot {
                size_bytes: source_capacity,
                snapshot_id: destination,
                source_volume_id: req.source_volume_id.clone(),
                creation_time: Some(Self::now_timestamp()),
                ready_to_use: true,
                group_snapshot_id: String::new(),
            }
        } else {
            let snapshot_id = format!("{}@{}", source.dataset, component);

            let existing = self
                .client
                .snapshot_get(&snapshot_id)
                .await
                .map_err(status_from_client)?;

            let creation_time = match &existing {
                Some(snap) => Timestamp {
                    seconds: snap.creation_unix().unwrap_or(0),
                    nanos: 0,
                },
                None => {
                    self.client
                        .snapshot_create(&source.dataset, &component)
                        .await
                        .map_err(status_from_client)?;
                    Self::now_timestamp()
                }
            };
            metrics::record_volume_operation(
                "snapshot_create",
                &source.protocol.to_string(),
                "ok",
            );

            csi::Snapshot {
                size_bytes: source_capacity,
                snapshot_id,
                source_volume_id: req.source_volume_id.clone(),
                creation_time: Some(creation_time),
                ready_to_use: true,
                group_snapshot_id: String::new(),
            }
        };

        info!(
            snapshot_id = %snapshot.snapshot_id,
            mode = %mode,
            "Snapshot created successfully"
        );

        Ok(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot),
        })
    }

    async fn delete_snapshot_inner(
        &self,
        req: csi::DeleteSnapshotRequest,
    ) -> Result<csi::DeleteSnapshotResponse, Status> {
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");

        if detached::is_detached_id(&req.snapshot_id) {
            // Refuse to recursively delete anything outside the snapshots
            // subtree.
            if !req
                .snapshot_id
                .contains(&format!("/{}/", detached::SNAPSHOTS_SUBTREE))
            {
                return Err(Status::invalid_argument(format!(
                    "'{}' is not a detached snapshot dataset",
                    req.snapshot_id
                )));
            }

            let _lock = self.locks.lock(&req.snapshot_id).await;
            self.client
                .dataset_delete(&req.snapshot_id, true)
                .await
                .map_err(status_from_client)?;
        } else {
            let (source_dataset, _) = req
                .snapshot_id
                .split_once('@')
                .unwrap_or((req.snapshot_id.as_str(), ""));

            let _lock = self.locks.lock(source_dataset).await;
            self.client
                .snapshot_delete(&req.snapshot_id)
                .await
                .map_err(status_from_client)?;
        }

        info!(snapshot_id = %req.snapshot_id, "Snapshot deleted successfully");
        Ok(csi::DeleteSnapshotResponse {})
    }

    /// Build a list entry for an existing backend dataset.
    async fn dataset_to_entry(&self, ds: &tnas_client::types::Dataset) -> Option<csi::Volume> {
        let handle = match ds.kind {
            DatasetKind::Filesystem => VolumeHandle::new(Protocol::Nfs, &ds.id)
                .with_context(context_keys::SERVER, &self.config.server),
            DatasetKind::Volume => {
                let mut handle = VolumeHandle::new(Protocol::Nvmeof, &ds.id)
                    .with_context(context_keys::SERVER, &self.config.server)
                    .with_context(
                        context_keys::PORT,
                        Protocol::Nvmeof.default_port().to_string(),
                    );
                match self.client.nvmeof_namespace_for_zvol(&ds.id).await {
                    Ok(Some(ns)) => {
                        if let Some(nqn) = ns.subsys.as_ref().and_then(|s| s.subnqn.clone()) {
                            handle = handle.with_context(context_keys::NQN, nqn);
                        }
                        if let Some(nguid) = ns.device_nguid.or(ns.device_uuid) {
                            handle = handle.with_context(context_keys::NGUID, nguid);
                        }
                        if let Some(nsid) = ns.nsid {
                            handle = handle.with_context(context_keys::NSID, nsid.to_string());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(dataset = %ds.id, error = %e, "Namespace lookup failed during listing");
                        return None;
                    }
                }
                handle
            }
        };

        Some(Self::handle_to_volume(
            &handle,
            ds.capacity_bytes() as i64,
            None,
        ))
    }
}

/// Map a backend client error onto the gRPC status surface.
fn status_from_client(err: ClientError) -> Status {
    match err {
        ClientError::NotFound(what) => Status::not_found(what),
        ClientError::Mismatch(what) => Status::already_exists(what),
        ClientError::InvalidName(what) => Status::invalid_argument(what),
        ClientError::ShrinkRefused { current, requested } => Status::invalid_argument(format!(
            "volume shrink refused: {current} bytes -> {requested} bytes"
        )),
        ClientError::NoTcpNvmeofPort => Status::failed_precondition(err.to_string()),
        ClientError::JobFailed(msg) => Status::internal(msg),
        ClientError::UnexpectedReply(msg) => Status::internal(msg),
        ClientError::Rpc(rpc) => match rpc {
            RpcError::Unavailable(msg) => Status::unavailable(msg),
            RpcError::Timeout(_) => Status::deadline_exceeded(rpc.to_string()),
            RpcError::AuthFailed(msg) => Status::unauthenticated(msg),
            RpcError::Fault { ref message, .. }
                if message.contains("ENOSPC") || message.contains("out of space") =>
            {
                Status::resource_exhausted(message.clone())
            }
            RpcError::Fault { .. } | RpcError::Protocol(_) => Status::internal(rpc.to_string()),
        },
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = RequestTimer::new("CreateVolume");
        let result = self.create_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = RequestTimer::new("DeleteVolume");
        let result = self.delete_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = RequestTimer::new("ControllerExpandVolume");
        let result = self.expand_volume_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::CreateDeleteSnapshot,
            Type::ExpandVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::ListSnapshots,
            Type::CloneVolume,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = RequestTimer::new("CreateSnapshot");
        let result = self.create_snapshot_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Delete a snapshot.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = RequestTimer::new("DeleteSnapshot");
        let result = self.delete_snapshot_inner(request.into_inner()).await;
        timer.observe(&result);
        result.map(Response::new)
    }

    /// Validate volume capabilities.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, "ValidateVolumeCapabilities request");

        let handle = VolumeHandle::parse(&req.volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        // Confirm only after verifying the backend object exists.
        self.client
            .dataset_get(&handle.dataset)
            .await
            .map_err(status_from_client)?;

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    /// Publish a volume to a node.
    ///
    /// There is no dynamic attach step for NFS or NVMe-oF (the node connects
    /// itself), so the capability is not advertised and the RPC is not
    /// supported.
    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    /// Unpublish a volume from a node (see controller_publish_volume).
    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    /// List volumes under the parent dataset.
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        debug!(
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListVolumes request"
        );

        let datasets = self
            .client
            .datasets_under(&self.config.parent_dataset)
            .await
            .map_err(status_from_client)?;

        let mut volumes = Vec::new();
        for ds in &datasets {
            // The snapshots subtree holds detached snapshots, not volumes.
            if ds.last_component() == detached::SNAPSHOTS_SUBTREE {
                continue;
            }
            if let Some(volume) = self.dataset_to_entry(ds).await {
                volumes.push(volume);
            }
        }
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

        let max_entries = if req.max_entries > 0 {
            req.max_entries as usize
        } else {
            volumes.len()
        };

        let start_idx = if !req.starting_token.is_empty() {
            req.starting_token
                .parse::<usize>()
                .map_err(|_| Status::aborted("invalid starting_token"))?
        } else {
            0
        };

        let end_idx = std::cmp::min(start_idx + max_entries, volumes.len());
        let next_token = if end_idx < volumes.len() {
            end_idx.to_string()
        } else {
            String::new()
        };

        let entries = volumes
            .into_iter()
            .skip(start_idx)
            .take(end_idx.saturating_sub(start_idx))
            .map(|volume| csi::list_volumes_response::Entry {
                volume: Some(volume),
                status: None,
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    /// Report pool capacity.
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();

        let pool = req
            .parameters
            .get("pool")
            .cloned()
            .unwrap_or_else(|| self.config.pool.clone());

        let available = self
            .client
            .pool_available(&pool)
            .await
            .map_err(status_from_client)?;

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: available as i64,
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    /// List snapshots (native and detached).
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        debug!(
            source_volume_id = %req.source_volume_id,
            snapshot_id = %req.snapshot_id,
            "ListSnapshots request"
        );

        let parent = &self.config.parent_dataset;
        let snapshots_subtree = format!("{parent}/{}", detached::SNAPSHOTS_SUBTREE);

        let source_filter = if req.source_volume_id.is_empty() {
            None
        } else {
            Some(
                VolumeHandle::parse(&req.source_volume_id)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?
                    .dataset,
            )
        };

        let mut entries: Vec<csi::Snapshot> = Vec::new();

        // Native ZFS snapshots of volumes under the parent.
        let native = self
            .client
            .snapshots_under(parent)
            .await
            .map_err(status_from_client)?;
        for snap in native {
            // Skip internal transients and the seeds inside detached datasets.
            if snap.snapshot_name.starts_with("csi-detach-")
                || snap.snapshot_name.starts_with("csi-clone-")
                || snap.dataset.starts_with(&format!("{snapshots_subtree}/"))
            {
                continue;
            }
            if let Some(filter) = &source_filter
                && &snap.dataset != filter
            {
                continue;
            }

            entries.push(csi::Snapshot {
                size_bytes: 0,
                snapshot_id: snap.id.clone(),
                source_volume_id: String::new(),
                creation_time: snap
                    .creation_unix()
                    .map(|seconds| Timestamp { seconds, nanos: 0 }),
                ready_to_use: true,
                group_snapshot_id: String::new(),
            });
        }

        // Detached snapshots; their source linkage is not persisted, so a
        // source filter excludes them.
        if source_filter.is_none() {
            let detached_datasets = self
                .client
                .datasets_under(&snapshots_subtree)
                .await
                .map_err(status_from_client)?;
            for ds in detached_datasets {
                entries.push(csi::Snapshot {
                    size_bytes: ds.capacity_bytes() as i64,
                    snapshot_id: ds.id.clone(),
                    source_volume_id: String::new(),
                    creation_time: None,
                    ready_to_use: true,
                    group_snapshot_id: String::new(),
                });
            }
        }

        if !req.snapshot_id.is_empty() {
            entries.retain(|s| s.snapshot_id == req.snapshot_id);
        }
        entries.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));

        let max_entries = if req.max_entries > 0 {
            req.max_entries as usize
        } else {
            entries.len()
        };

        let start_idx = if !req.starting_token.is_empty() {
            req.starting_token
                .parse::<usize>()
                .map_err(|_| Status::aborted("invalid starting_token"))?
        } else {
            0
        };

        let end_idx = std::cmp::min(start_idx + max_entries, entries.len());
        let next_token = if end_idx < entries.len() {
            end_idx.to_string()
        } else {
            String::new()
        };

        let page = entries
            .into_iter()
            .skip(start_idx)
            .take(end_idx.saturating_sub(start_idx))
            .map(|snapshot| csi::list_snapshots_response::Entry {
                snapshot: Some(snapshot),
            })
            .collect();

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries: page,
            next_token,
        }))
    }

    /// Get volume (not implemented).
    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    /// Modify volume (not implemented).
    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_volume_size() {
        // No capacity range
        assert_eq!(
            ControllerService::get_volume_size(None),
            DEFAULT_VOLUME_SIZE
        );

        // Required bytes takes precedence
        let range = csi::CapacityRange {
            required_bytes: 2 * 1024 * 1024 * 1024,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)),
            2 * 1024 * 1024 * 1024
        );

        // Fall back to limit_bytes if required_bytes is 0
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)),
            5 * 1024 * 1024 * 1024
        );

        // Default if both are 0
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)),
            DEFAULT_VOLUME_SIZE
        );
    }

    fn mount_capability(fs_type: &str) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: fs_type.to_string(),
                    mount_flags: vec![],
                    volume_mount_group: String::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn block_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    #[test]
    fn test_wants_block() {
        assert!(!ControllerService::wants_block(&[mount_capability("ext4")]).unwrap());
        assert!(ControllerService::wants_block(&[block_capability()]).unwrap());
        assert!(
            ControllerService::wants_block(&[mount_capability("ext4"), block_capability()])
                .is_err()
        );
        assert!(!ControllerService::wants_block(&[]).unwrap());
    }

    #[test]
    fn test_requested_fs_type_prefers_capability() {
        let params = VolumeParameters {
            fs_type: FsType::Ext4,
            ..Default::default()
        };

        let fs =
            ControllerService::requested_fs_type(&[mount_capability("btrfs")], &params).unwrap();
        assert_eq!(fs, FsType::Btrfs);

        // Empty capability fs_type falls back to parameters
        let fs = ControllerService::requested_fs_type(&[mount_capability("")], &params).unwrap();
        assert_eq!(fs, FsType::Ext4);

        // Unknown capability fs_type is rejected
        assert!(ControllerService::requested_fs_type(&[mount_capability("ufs")], &params).is_err());
    }

    #[test]
    fn test_status_from_client_mapping() {
        assert_eq!(
            status_from_client(ClientError::NotFound("tank/x".into())).code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            status_from_client(ClientError::Mismatch("tank/x".into())).code(),
            tonic::Code::AlreadyExists
        );
        assert_eq!(
            status_from_client(ClientError::NoTcpNvmeofPort).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            status_from_client(ClientError::ShrinkRefused {
                current: 2,
                requested: 1
            })
            .code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            status_from_client(ClientError::Rpc(RpcError::Unavailable("gone".into()))).code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            status_from_client(ClientError::Rpc(RpcError::Timeout(
                std::time::Duration::from_secs(1)
            )))
            .code(),
            tonic::Code::DeadlineExceeded
        );
        assert_eq!(
            status_from_client(ClientError::Rpc(RpcError::Fault {
                code: 28,
                message: "[ENOSPC] pool is out of space".into()
            }))
            .code(),
            tonic::Code::ResourceExhausted
        );
    }

    #[test]
    fn test_failed_precondition_carries_stable_tag() {
        let status = status_from_client(ClientError::NoTcpNvmeofPort);
        assert!(status.message().contains("NoTCPNVMeOFPort"));
    }

    #[test]
    fn test_handle_to_volume_context() {
        let handle = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/vol1")
            .with_context(context_keys::SERVER, "192.0.2.10")
            .with_context(context_keys::NQN, "nqn.2005-03.org.truenas:csi-test");

        let volume = ControllerService::handle_to_volume(&handle, 1 << 30, None);

        assert_eq!(volume.capacity_bytes, 1 << 30);
        assert_eq!(volume.volume_id, handle.encode());
        assert_eq!(
            volume.volume_context.get("server").map(String::as_str),
            Some("192.0.2.10")
        );
        assert_eq!(
            volume.volume_context.get("protocol").map(String::as_str),
            Some("nvmeof")
        );
        assert_eq!(
            volume.volume_context.get("dataset").map(String::as_str),
            Some("tank/csi/vol1")
        );
    }
}
