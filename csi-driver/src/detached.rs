//! Detached snapshot engine.
//!
//! A detached snapshot is a fully independent dataset produced by piping
//! `zfs send` of a transient snapshot into `zfs receive` under the
//! `<parent>/snapshots/` tree. Unlike a native ZFS snapshot, its lifetime is
//! not bound to the source: deleting the source volume leaves the detached
//! copy usable for restores.

use tnas_client::{ClientError, TruenasClient};
use tracing::{info, warn};
use uuid::Uuid;

/// Subtree under the parent dataset that holds detached snapshots.
pub const SNAPSHOTS_SUBTREE: &str = "snapshots";

/// Dataset path of a detached snapshot.
pub fn detached_dataset(parent_dataset: &str, snapshot_component: &str) -> String {
    format!("{parent_dataset}/{SNAPSHOTS_SUBTREE}/{snapshot_component}")
}

/// True when a snapshot id refers to a detached snapshot (a dataset path)
/// rather than a native ZFS snapshot (`dataset@name`).
pub fn is_detached_id(snapshot_id: &str) -> bool {
    !snapshot_id.contains('@')
}

/// Materialize a detached snapshot of `source_dataset`.
///
/// Flow: transient snapshot on the source, send/receive into the snapshots
/// subtree, drop the transient. The received dataset keeps the transient as
/// its internal snapshot, which later seeds restores. On failure the partial
/// destination and the transient snapshot are cleaned up best-effort.
pub async fn create(
    client: &TruenasClient,
    parent_dataset: &str,
    source_dataset: &str,
    snapshot_component: &str,
) -> Result<String, ClientError> {
    let destination = detached_dataset(parent_dataset, snapshot_component);

    // Already materialized by a previous attempt.
    if let Ok(existing) = client.dataset_get(&destination).await {
        info!(snapshot = %existing.id, "Detached snapshot already exists");
        return Ok(destination);
    }

    client
        .dataset_ensure(
            &format!("{parent_dataset}/{SNAPSHOTS_SUBTREE}"),
            &serde_json::Map::new(),
        )
        .await?;

    let transient = format!("csi-detach-{}", Uuid::new_v4().simple());
    client.snapshot_create(source_dataset, &transient).await?;
    let transient_id = format!("{source_dataset}@{transient}");

    let result = client.send_receive(&transient_id, &destination).await;

    if let Err(e) = result {
        warn!(
            source = %transient_id,
            destination = %destination,
            error = %e,
            "Detached snapshot replication failed, cleaning up"
        );
        if let Err(cleanup) = client.dataset_delete(&destination, true).await {
            warn!(destination = %destination, error = %cleanup, "Partial destination cleanup failed");
        }
        if let Err(cleanup) = client.snapshot_delete(&transient_id).await {
            warn!(snapshot = %transient_id, error = %cleanup, "Transient snapshot cleanup failed");
        }
        return Err(e);
    }

    // The destination carries its own copy of the transient snapshot; the
    // source-side one is no longer needed.
    if let Err(e) = client.snapshot_delete(&transient_id).await {
        warn!(snapshot = %transient_id, error = %e, "Transient snapshot cleanup failed");
    }

    // Verify the destination actually materialized before reporting ready.
    client.dataset_get(&destination).await?;

    info!(
        source = %source_dataset,
        destination = %destination,
        "Detached snapshot created"
    );
    Ok(destination)
}

/// Restore a detached snapshot into a new volume dataset.
///
/// Sends the destination's internal snapshot into the target path; the
/// caller applies property overrides afterwards.
pub async fn restore(
    client: &TruenasClient,
    detached_dataset: &str,
    target_dataset: &str,
) -> Result<(), ClientError> {
    let mut snapshots = client.snapshots_for_dataset(detached_dataset).await?;
    snapshots.sort_by_key(|s| s.creation_unix().unwrap_or(0));

    let seed = snapshots
        .last()
        .ok_or_else(|| ClientError::NotFound(format!("{detached_dataset} has no snapshots")))?;

    client.send_receive(&seed.id, target_dataset).await?;

    info!(
        source = %detached_dataset,
        target = %target_dataset,
        "Restored volume from detached snapshot"
    );
    Ok(())
}
