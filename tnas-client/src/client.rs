//! Typed operations against the TrueNAS middleware.
//!
//! Every method is a single JSON-RPC call or a short pipeline, written as
//! `ensure`/tolerant-delete so that orchestrator retries converge instead of
//! erroring. The session handles transport failures; this layer handles the
//! storage semantics.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::error::{ClientError, Result};
use crate::rpc::{RpcError, SessionHandle};
use crate::types::{
    Dataset, DatasetKind, NfsShare, NvmeofNamespace, NvmeofPort, NvmeofSubsystem, ZfsSnapshot,
};

/// Timeout for long-running middleware jobs (`zfs send | zfs receive`).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Typed client over a backend session.
#[derive(Clone)]
pub struct TruenasClient {
    session: SessionHandle,
    job_timeout: Duration,
}

impl TruenasClient {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// The underlying session handle (state observation).
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    // ========================================================================
    // Datasets and ZVOLs
    // ========================================================================

    /// Look up a dataset by full path.
    pub async fn dataset_get(&self, path: &str) -> Result<Dataset> {
        self.query_dataset(path)
            .await?
            .ok_or_else(|| ClientError::NotFound(path.to_string()))
    }

    async fn query_dataset(&self, path: &str) -> Result<Option<Dataset>> {
        validate_dataset_path(path)?;
        let result = self
            .session
            .call(
                "pool.dataset.query",
                json!([[["id", "=", path]], {"extra": {"retrieve_children": false}}]),
            )
            .await?;
        let mut datasets: Vec<Dataset> = parse_reply(result)?;
        Ok(datasets.drain(..).next())
    }

    /// List datasets that are direct children of `parent`.
    pub async fn datasets_under(&self, parent: &str) -> Result<Vec<Dataset>> {
        validate_dataset_path(parent)?;
        let prefix = format!("{parent}/");
        let result = self
            .session
            .call(
                "pool.dataset.query",
                json!([[["id", "^", prefix]], {"extra": {"retrieve_children": false}}]),
            )
            .await?;
        let datasets: Vec<Dataset> = parse_reply(result)?;
        Ok(datasets
            .into_iter()
            .filter(|d| !d.id[prefix.len()..].contains('/'))
            .collect())
    }

    /// Create a filesystem dataset, or return the existing one.
    ///
    /// Re-creation with the same path succeeds if the existing object is a
    /// filesystem; a ZVOL at the same path is a mismatch.
    #[instrument(skip(self, props))]
    pub async fn dataset_ensure(&self, path: &str, props: &Map<String, Value>) -> Result<Dataset> {
        validate_dataset_path(path)?;

        if let Some(existing) = self.query_dataset(path).await? {
            if existing.kind != DatasetKind::Filesystem {
                return Err(ClientError::Mismatch(path.to_string()));
            }
            ensure_properties_match(&existing, props)?;
            debug!(dataset = %path, "Dataset already exists");
            return Ok(existing);
        }

        let mut body = Map::new();
        body.insert("name".to_string(), json!(path));
        body.insert("type".to_string(), json!("FILESYSTEM"));
        for (k, v) in props {
            body.insert(k.clone(), v.clone());
        }

        let result = self
            .session
            .call("pool.dataset.create", json!([Value::Object(body)]))
            .await;

        match result {
            Ok(value) => parse_reply(value),
            // Lost the race against a concurrent create; the object is there.
            Err(e) if fault_is_duplicate(&e) => self.dataset_get(path).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Create a ZVOL, or return the existing one if its size matches.
    #[instrument(skip(self, props))]
    pub async fn zvol_ensure(
        &self,
        path: &str,
        capacity_bytes: u64,
        props: &Map<String, Value>,
    ) -> Result<Dataset> {
        validate_dataset_path(path)?;

        if let Some(existing) = self.query_dataset(path).await? {
            if existing.kind != DatasetKind::Volume
                || existing.capacity_bytes() != capacity_bytes
            {
                return Err(ClientError::Mismatch(path.to_string()));
            }
            ensure_properties_match(&existing, props)?;
            debug!(zvol = %path, "ZVOL already exists");
            return Ok(existing);
        }

        let mut body = Map::new();
        body.insert("name".to_string(), json!(path));
        body.insert("type".to_string(), json!("VOLUME"));
        body.insert("volsize".to_string(), json!(capacity_bytes));
        body.insert("sparse".to_string(), json!(true));
        for (k, v) in props {
            body.insert(k.clone(), v.clone());
        }

        let result = self
            .session
            .call("pool.dataset.create", json!([Value::Object(body)]))
            .await;

        match result {
            Ok(value) => parse_reply(value),
            Err(e) if fault_is_duplicate(&e) => self.dataset_get(path).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a dataset or ZVOL. Absence is success.
    #[instrument(skip(self))]
    pub async fn dataset_delete(&self, path: &str, recursive: bool) -> Result<()> {
        validate_dataset_path(path)?;

        let result = self
            .session
            .call(
                "pool.dataset.delete",
                json!([path, {"recursive": recursive, "force": true}]),
            )
            .await;

        match result {
            Ok(_) => {
                info!(dataset = %path, "Deleted dataset");
                Ok(())
            }
            Err(e) if fault_is_absent(&e) => {
                debug!(dataset = %path, "Dataset already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Grow a ZVOL. Shrinking is refused; resizing to the current size is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn zvol_resize(&self, path: &str, new_bytes: u64) -> Result<u64> {
        let current = self.dataset_get(path).await?;
        if current.kind != DatasetKind::Volume {
            return Err(ClientError::Mismatch(path.to_string()));
        }

        let current_bytes = current.capacity_bytes();
        if new_bytes < current_bytes {
            return Err(ClientError::ShrinkRefused {
                current: current_bytes,
                requested: new_bytes,
            });
        }
        if new_bytes == current_bytes {
            return Ok(current_bytes);
        }

        self.session
            .call("pool.dataset.update", json!([path, {"volsize": new_bytes}]))
            .await?;
        info!(zvol = %path, volsize = new_bytes, "Resized ZVOL");
        Ok(new_bytes)
    }

    /// Set the capacity quota on a filesystem dataset.
    #[instrument(skip(self))]
    pub async fn dataset_set_refquota(&self, path: &str, bytes: u64) -> Result<()> {
        validate_dataset_path(path)?;
        self.session
            .call("pool.dataset.update", json!([path, {"refquota": bytes}]))
            .await?;
        Ok(())
    }

    /// Apply arbitrary property updates to an existing dataset.
    pub async fn dataset_update(&self, path: &str, props: &Map<String, Value>) -> Result<()> {
        validate_dataset_path(path)?;
        if props.is_empty() {
            return Ok(());
        }
        self.session
            .call(
                "pool.dataset.update",
                json!([path, Value::Object(props.clone())]),
            )
            .await?;
        Ok(())
    }

    /// Free capacity of the pool's root dataset.
    pub async fn pool_available(&self, pool: &str) -> Result<u64> {
        let root = self.dataset_get(pool).await?;
        Ok(root
            .available
            .as_ref()
            .map(|p| p.bytes())
            .unwrap_or_default())
    }

    // ========================================================================
    // NFS shares
    // ========================================================================

    /// Share a dataset over NFS, or return the existing share.
    #[instrument(skip(self))]
    pub async fn nfs_share_ensure(
        &self,
        dataset: &str,
        allowed_networks: &[String],
    ) -> Result<NfsShare> {
        validate_dataset_path(dataset)?;
        let mount_path = share_path(dataset);

        if let Some(existing) = self.query_nfs_share(&mount_path).await? {
            debug!(path = %mount_path, "NFS share already exists");
            return Ok(existing);
        }

        let result = self
            .session
            .call(
                "sharing.nfs.create",
                json!([{
                    "path": mount_path,
                    "enabled": true,
                    "networks": allowed_networks,
                }]),
            )
            .await;

        match result {
            Ok(value) => {
                info!(path = %mount_path, "Created NFS share");
                parse_reply(value)
            }
            Err(e) if fault_is_duplicate(&e) => self
                .query_nfs_share(&mount_path)
                .await?
                .ok_or_else(|| ClientError::UnexpectedReply("share vanished after create".into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the NFS share for a dataset. Absence is success.
    #[instrument(skip(self))]
    pub async fn nfs_share_delete(&self, dataset: &str) -> Result<()> {
        validate_dataset_path(dataset)?;
        let mount_path = share_path(dataset);

        let Some(share) = self.query_nfs_share(&mount_path).await? else {
            debug!(path = %mount_path, "NFS share already gone");
            return Ok(());
        };

        self.session
            .call("sharing.nfs.delete", json!([share.id]))
            .await?;
        info!(path = %mount_path, id = share.id, "Deleted NFS share");
        Ok(())
    }

    async fn query_nfs_share(&self, mount_path: &str) -> Result<Option<NfsShare>> {
        let result = self
            .session
            .call("sharing.nfs.query", json!([[["path", "=", mount_path]]]))
            .await?;
        let mut shares: Vec<NfsShare> = parse_reply(result)?;
        Ok(shares.drain(..).next())
    }

    // ========================================================================
    // NVMe-oF
    // ========================================================================

    /// List NVMe-oF ports for the given transport.
    ///
    /// An empty result means the appliance has no portal for this transport
    /// and nothing can be attached; callers surface this as a precondition
    /// failure.
    pub async fn nvmeof_port_list(&self, transport: &str) -> Result<Vec<NvmeofPort>> {
        let result = self.session.call("nvmet.port.query", json!([])).await?;
        let ports: Vec<NvmeofPort> = parse_reply(result)?;
        let matching: Vec<NvmeofPort> = ports
            .into_iter()
            .filter(|p| p.transport.eq_ignore_ascii_case(transport))
            .collect();

        if matching.is_empty() {
            warn!(transport = %transport, "No TCP NVMe-oF port");
            return Err(ClientError::NoTcpNvmeofPort);
        }
        Ok(matching)
    }

    /// Ensure a subsystem with the given NQN exists and is reachable through
    /// a TCP port.
    #[instrument(skip(self))]
    pub async fn nvmeof_subsystem_ensure(&self, nqn: &str) -> Result<NvmeofSubsystem> {
        let ports = self.nvmeof_port_list("tcp").await?;

        let subsystem = match self.query_subsystem(nqn).await? {
            Some(existing) => existing,
            None => {
                let name = nqn.rsplit(':').next().unwrap_or(nqn);
                let result = self
                    .session
                    .call(
                        "nvmet.subsys.create",
                        json!([{"name": name, "subnqn": nqn}]),
                    )
                    .await;
                match result {
                    Ok(value) => {
                        info!(nqn = %nqn, "Created NVMe-oF subsystem");
                        parse_reply(value)?
                    }
                    Err(e) if fault_is_duplicate(&e) => self
                        .query_subsystem(nqn)
                        .await?
                        .ok_or_else(|| {
                            ClientError::UnexpectedReply("subsystem vanished after create".into())
                        })?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // Bind the subsystem to every TCP port; duplicates are fine.
        for port in &ports {
            let result = self
                .session
                .call(
                    "nvmet.port_subsys.create",
                    json!([{"port_id": port.id, "subsys_id": subsystem.id}]),
                )
                .await;
            match result {
                Ok(_) => {}
                Err(e) if fault_is_duplicate(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(subsystem)
    }

    async fn query_subsystem(&self, nqn: &str) -> Result<Option<NvmeofSubsystem>> {
        let result = self
            .session
            .call("nvmet.subsys.query", json!([[["subnqn", "=", nqn]]]))
            .await?;
        let mut subsystems: Vec<NvmeofSubsystem> = parse_reply(result)?;
        Ok(subsystems.drain(..).next())
    }

    /// Attach a ZVOL as a namespace of the subsystem. Idempotent: an existing
    /// namespace backed by the same ZVOL is returned as-is.
    #[instrument(skip(self))]
    pub async fn nvmeof_namespace_attach(
        &self,
        nqn: &str,
        zvol_path: &str,
    ) -> Result<NvmeofNamespace> {
        validate_dataset_path(zvol_path)?;
        let subsystem = self.nvmeof_subsystem_ensure(nqn).await?;

        if let Some(existing) = self.nvmeof_namespace_for_zvol(zvol_path).await? {
            debug!(zvol = %zvol_path, nsid = ?existing.nsid, "Namespace already attached");
            return Ok(existing);
        }

        let result = self
            .session
            .call(
                "nvmet.namespace.create",
                json!([{
                    "subsys_id": subsystem.id,
                    "device_type": "ZVOL",
                    "device_path": format!("zvol/{zvol_path}"),
                    "enabled": true,
                }]),
            )
            .await?;
        let namespace: NvmeofNamespace = parse_reply(result)?;
        info!(
            nqn = %nqn,
            zvol = %zvol_path,
            nsid = ?namespace.nsid,
            "Attached NVMe-oF namespace"
        );
        Ok(namespace)
    }

    /// Detach a namespace by NQN and NSID. Absence is success.
    #[instrument(skip(self))]
    pub async fn nvmeof_namespace_detach(&self, nqn: &str, nsid: u32) -> Result<()> {
        let namespaces = self.nvmeof_namespaces().await?;
        let Some(ns) = namespaces.iter().find(|ns| {
            ns.nsid == Some(nsid)
                && ns
                    .subsys
                    .as_ref()
                    .and_then(|s| s.subnqn.as_deref())
                    .is_some_and(|s| s == nqn)
        }) else {
            debug!(nqn = %nqn, nsid, "Namespace already detached");
            return Ok(());
        };

        self.session
            .call("nvmet.namespace.delete", json!([ns.id]))
            .await?;
        info!(nqn = %nqn, nsid, "Detached NVMe-oF namespace");
        Ok(())
    }

    /// Find the namespace backed by a ZVOL, if any.
    pub async fn nvmeof_namespace_for_zvol(
        &self,
        zvol_path: &str,
    ) -> Result<Option<NvmeofNamespace>> {
        let namespaces = self.nvmeof_namespaces().await?;
        Ok(namespaces.into_iter().find(|ns| ns.backs_zvol(zvol_path)))
    }

    /// Delete a namespace by its backend id. Absence is success.
    pub async fn nvmeof_namespace_delete(&self, id: i64) -> Result<()> {
        let result = self
            .session
            .call("nvmet.namespace.delete", json!([id]))
            .await;

        match result {
            Ok(_) => {
                info!(id, "Deleted NVMe-oF namespace");
                Ok(())
            }
            Err(e) if fault_is_absent(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List all NVMe-oF namespaces.
    pub async fn nvmeof_namespaces(&self) -> Result<Vec<NvmeofNamespace>> {
        let result = self.session.call("nvmet.namespace.query", json!([])).await?;
        parse_reply(result)
    }

    // ========================================================================
    // Snapshots and clones
    // ========================================================================

    /// Create a ZFS snapshot `dataset@name`.
    #[instrument(skip(self))]
    pub async fn snapshot_create(&self, dataset: &str, name: &str) -> Result<ZfsSnapshot> {
        validate_dataset_path(dataset)?;
        validate_snapshot_name(name)?;

        let result = self
            .session
            .call(
                "zfs.snapshot.create",
                json!([{"dataset": dataset, "name": name}]),
            )
            .await;

        match result {
            Ok(value) => parse_reply(value),
            Err(e) if fault_is_duplicate(&e) => {
                let id = format!("{dataset}@{name}");
                self.snapshot_get(&id)
                    .await?
                    .ok_or_else(|| ClientError::NotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a snapshot by full id (`dataset@name`). Absence is success.
    ///
    /// Deletion is deferred so linked clones do not block it.
    #[instrument(skip(self))]
    pub async fn snapshot_delete(&self, snapshot_id: &str) -> Result<()> {
        let result = self
            .session
            .call("zfs.snapshot.delete", json!([snapshot_id, {"defer": true}]))
            .await;

        match result {
            Ok(_) => {
                info!(snapshot = %snapshot_id, "Deleted snapshot");
                Ok(())
            }
            Err(e) if fault_is_absent(&e) => {
                debug!(snapshot = %snapshot_id, "Snapshot already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a snapshot by full id.
    pub async fn snapshot_get(&self, snapshot_id: &str) -> Result<Option<ZfsSnapshot>> {
        let result = self
            .session
            .call(
                "zfs.snapshot.query",
                json!([[["id", "=", snapshot_id]], {"extra": {"properties": ["creation"]}}]),
            )
            .await?;
        let mut snapshots: Vec<ZfsSnapshot> = parse_reply(result)?;
        Ok(snapshots.drain(..).next())
    }

    /// List snapshots of one dataset.
    pub async fn snapshots_for_dataset(&self, dataset: &str) -> Result<Vec<ZfsSnapshot>> {
        validate_dataset_path(dataset)?;
        let result = self
            .session
            .call(
                "zfs.snapshot.query",
                json!([[["dataset", "=", dataset]], {"extra": {"properties": ["creation"]}}]),
            )
            .await?;
        parse_reply(result)
    }

    /// List snapshots of all datasets under a parent.
    pub async fn snapshots_under(&self, parent: &str) -> Result<Vec<ZfsSnapshot>> {
        validate_dataset_path(parent)?;
        let result = self
            .session
            .call(
                "zfs.snapshot.query",
                json!([
                    [["dataset", "^", format!("{parent}/")]],
                    {"extra": {"properties": ["creation"]}}
                ]),
            )
            .await?;
        parse_reply(result)
    }

    /// Clone a snapshot into a new dataset (linked to the source).
    #[instrument(skip(self))]
    pub async fn clone_create(&self, snapshot_id: &str, target: &str) -> Result<()> {
        validate_dataset_path(target)?;
        self.session
            .call(
                "zfs.snapshot.clone",
                json!([{"snapshot": snapshot_id, "dataset_dst": target}]),
            )
            .await?;
        info!(snapshot = %snapshot_id, target = %target, "Cloned snapshot");
        Ok(())
    }

    // ========================================================================
    // Replication (zfs send | zfs receive)
    // ========================================================================

    /// Replicate one snapshot into an independent dataset via
    /// `zfs send | zfs receive` on the appliance. Blocks until the
    /// replication job finishes.
    #[instrument(skip(self))]
    pub async fn send_receive(&self, source_snapshot: &str, target_dataset: &str) -> Result<()> {
        let (source_dataset, snap_name) = source_snapshot
            .split_once('@')
            .ok_or_else(|| ClientError::InvalidName(source_snapshot.to_string()))?;
        validate_dataset_path(source_dataset)?;
        validate_dataset_path(target_dataset)?;
        validate_snapshot_name(snap_name)?;

        let job = self
            .session
            .call(
                "replication.run_onetime",
                json!([{
                    "direction": "PUSH",
                    "transport": "LOCAL",
                    "source_datasets": [source_dataset],
                    "target_dataset": target_dataset,
                    "name_regex": format!("^{snap_name}$"),
                    "recursive": false,
                    "retention_policy": "NONE",
                    "readonly": "IGNORE",
                }]),
            )
            .await?;

        let job_id = job
            .as_i64()
            .ok_or_else(|| ClientError::UnexpectedReply(format!("job id expected, got {job}")))?;

        debug!(job_id, source = %source_snapshot, target = %target_dataset, "Replication started");
        self.job_wait(job_id).await?;
        info!(source = %source_snapshot, target = %target_dataset, "Replication finished");
        Ok(())
    }

    /// Wait for a middleware job, surfacing its failure message.
    async fn job_wait(&self, job_id: i64) -> Result<Value> {
        self.session
            .call_with_timeout("core.job_wait", json!([job_id]), self.job_timeout)
            .await
            .map_err(|e| match e {
                RpcError::Fault { message, .. } => ClientError::JobFailed(message),
                other => ClientError::Rpc(other),
            })
    }
}

/// Mountpoint of a dataset on the appliance.
fn share_path(dataset: &str) -> String {
    format!("/mnt/{dataset}")
}

/// Verify requested create-time properties against an existing dataset.
///
/// A re-create only adopts the existing object when every requested
/// property matches what the middleware reports for it. Properties the
/// middleware does not echo back cannot be checked and are skipped.
fn ensure_properties_match(existing: &Dataset, props: &Map<String, Value>) -> Result<()> {
    for (key, requested) in props {
        if existing.property_matches(key, requested) == Some(false) {
            return Err(ClientError::Mismatch(format!(
                "{} (property '{key}' differs)",
                existing.id
            )));
        }
    }
    Ok(())
}

fn parse_reply<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ClientError::UnexpectedReply(e.to_string()))
}

/// True when a middleware fault means the object does not exist.
fn fault_is_absent(err: &RpcError) -> bool {
    match err {
        RpcError::Fault { code, message } => {
            *code == 2
                || message.contains("ENOENT")
                || message.contains("does not exist")
                || message.contains("not found")
        }
        _ => false,
    }
}

/// True when a middleware fault means the object already exists.
fn fault_is_duplicate(err: &RpcError) -> bool {
    match err {
        RpcError::Fault { code, message } => {
            *code == 17 || message.contains("EEXIST") || message.contains("already exists")
        }
        _ => false,
    }
}

/// Validate a dataset path for use in middleware calls.
///
/// Dataset paths are pool-rooted, slash-separated, and limited to the
/// characters ZFS accepts in component names.
pub fn validate_dataset_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ClientError::InvalidName(
            "dataset path cannot be empty".to_string(),
        ));
    }
    if path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(ClientError::InvalidName(format!(
            "malformed dataset path '{path}'"
        )));
    }
    if path.split('/').any(|c| c == "." || c == "..") {
        return Err(ClientError::InvalidName(format!(
            "dataset path '{path}' contains a relative component"
        )));
    }

    let valid = path.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '/' || c == '.' || c == '_' || c == '-' || c == ':'
    });
    if !valid {
        return Err(ClientError::InvalidName(format!(
            "dataset path '{path}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a snapshot name (the part after `@`).
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ClientError::InvalidName(
            "snapshot name cannot be empty".to_string(),
        ));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(ClientError::InvalidName(format!(
            "snapshot name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_dataset_path_valid() {
        assert!(validate_dataset_path("tank").is_ok());
        assert!(validate_dataset_path("tank/csi/vol1").is_ok());
        assert!(validate_dataset_path("tank/csi/snapshots/snap-1.2").is_ok());
    }

    #[test]
    fn test_validate_dataset_path_invalid() {
        assert!(validate_dataset_path("").is_err());
        assert!(validate_dataset_path("/tank/csi").is_err());
        assert!(validate_dataset_path("tank/csi/").is_err());
        assert!(validate_dataset_path("tank//csi").is_err());
        assert!(validate_dataset_path("tank/../etc").is_err());
        assert!(validate_dataset_path("tank/./csi").is_err());
        assert!(validate_dataset_path("tank/csi vol").is_err());
        assert!(validate_dataset_path("tank/csi@snap").is_err());
        assert!(validate_dataset_path("tank/csi;rm").is_err());
    }

    #[test]
    fn test_validate_snapshot_name() {
        assert!(validate_snapshot_name("snap1").is_ok());
        assert!(validate_snapshot_name("csi-2f5c-transient").is_ok());
        assert!(validate_snapshot_name("").is_err());
        assert!(validate_snapshot_name("a/b").is_err());
        assert!(validate_snapshot_name("a@b").is_err());
        assert!(validate_snapshot_name("a b").is_err());
    }

    #[test]
    fn test_share_path() {
        assert_eq!(share_path("tank/csi/vol1"), "/mnt/tank/csi/vol1");
    }

    #[test]
    fn test_ensure_properties_match() {
        let existing: Dataset = serde_json::from_str(
            r#"{
                "id": "tank/csi/vol1",
                "type": "FILESYSTEM",
                "compression": {"parsed": "lz4", "rawvalue": "lz4", "value": "LZ4"}
            }"#,
        )
        .unwrap();

        let mut props = Map::new();
        assert!(ensure_properties_match(&existing, &props).is_ok());

        // Matching value (any case) adopts the existing dataset
        props.insert("compression".to_string(), json!("LZ4"));
        assert!(ensure_properties_match(&existing, &props).is_ok());

        // A property the middleware does not report is skipped
        props.insert("atime".to_string(), json!("OFF"));
        assert!(ensure_properties_match(&existing, &props).is_ok());

        // A divergent value is a mismatch
        props.insert("compression".to_string(), json!("OFF"));
        let err = ensure_properties_match(&existing, &props).unwrap_err();
        assert!(matches!(err, ClientError::Mismatch(_)));
        assert!(err.to_string().contains("compression"));
    }

    #[test]
    fn test_fault_classification() {
        let absent = RpcError::Fault {
            code: 2,
            message: "[ENOENT] dataset does not exist".into(),
        };
        assert!(fault_is_absent(&absent));
        assert!(!fault_is_duplicate(&absent));

        let duplicate = RpcError::Fault {
            code: 17,
            message: "[EEXIST] already exists".into(),
        };
        assert!(fault_is_duplicate(&duplicate));
        assert!(!fault_is_absent(&duplicate));

        let unrelated = RpcError::Unavailable("socket closed".into());
        assert!(!fault_is_absent(&unrelated));
        assert!(!fault_is_duplicate(&unrelated));
    }
}
