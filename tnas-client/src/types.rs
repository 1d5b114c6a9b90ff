//! Wire types returned by the TrueNAS middleware.
//!
//! Only the fields the driver consumes are modeled; the middleware returns
//! far more and serde ignores the rest.

use serde::Deserialize;
use serde_json::{Map, Value};

/// ZFS object kind as reported by `pool.dataset.query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetKind {
    /// A filesystem dataset (NFS-exportable).
    Filesystem,
    /// A ZVOL (block device).
    Volume,
}

/// A size-valued ZFS property (`volsize`, `refquota`, `available`, `used`).
///
/// The middleware reports `{"parsed": <bytes>, "rawvalue": "..."}`; `parsed`
/// is absent for unset properties.
#[derive(Debug, Clone, Deserialize)]
pub struct SizeProperty {
    #[serde(default)]
    pub parsed: Option<u64>,
}

impl SizeProperty {
    pub fn bytes(&self) -> u64 {
        self.parsed.unwrap_or(0)
    }
}

/// A ZFS dataset or ZVOL.
#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    /// Full dataset path, e.g. `tank/csi/vol1`.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DatasetKind,
    #[serde(default)]
    pub volsize: Option<SizeProperty>,
    #[serde(default)]
    pub refquota: Option<SizeProperty>,
    #[serde(default)]
    pub available: Option<SizeProperty>,
    #[serde(default)]
    pub used: Option<SizeProperty>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Remaining properties as reported by the middleware (compression,
    /// recordsize, ...), used to verify idempotent re-creates.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Dataset {
    /// Provisioned capacity: `volsize` for ZVOLs, `refquota` for datasets.
    pub fn capacity_bytes(&self) -> u64 {
        match self.kind {
            DatasetKind::Volume => self.volsize.as_ref().map(SizeProperty::bytes).unwrap_or(0),
            DatasetKind::Filesystem => {
                self.refquota.as_ref().map(SizeProperty::bytes).unwrap_or(0)
            }
        }
    }

    /// Last path component (the volume name).
    pub fn last_component(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// Compare a requested create-time property against what the middleware
    /// reports. `None` when the property is not echoed back and cannot be
    /// checked.
    pub fn property_matches(&self, key: &str, requested: &Value) -> Option<bool> {
        let reported = self.properties.get(key)?;
        Some(property_values_equal(reported, requested))
    }
}

/// Properties come back as `{"parsed": ..., "rawvalue": "...", "value": "..."}`;
/// a match against any representation counts.
fn property_values_equal(reported: &Value, requested: &Value) -> bool {
    if let Value::Object(obj) = reported {
        return ["parsed", "rawvalue", "value"]
            .iter()
            .filter_map(|k| obj.get(*k))
            .any(|v| scalar_values_equal(v, requested));
    }
    scalar_values_equal(reported, requested)
}

fn scalar_values_equal(reported: &Value, requested: &Value) -> bool {
    match (reported, requested) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Number(a), Value::String(b)) => {
            b.parse::<f64>().is_ok_and(|n| a.as_f64() == Some(n))
        }
        (Value::String(a), Value::Number(b)) => {
            a.parse::<f64>().is_ok_and(|n| b.as_f64() == Some(n))
        }
        (a, b) => a == b,
    }
}

/// A ZFS snapshot as reported by `zfs.snapshot.query`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZfsSnapshot {
    /// Full snapshot id, e.g. `tank/csi/vol1@snap`.
    pub id: String,
    pub dataset: String,
    pub snapshot_name: String,
    #[serde(default)]
    pub properties: Option<Value>,
}

impl ZfsSnapshot {
    /// Creation time as Unix seconds, when the query included properties.
    pub fn creation_unix(&self) -> Option<i64> {
        self.properties
            .as_ref()?
            .get("creation")?
            .get("parsed")?
            .as_i64()
    }
}

/// An NFS share entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NfsShare {
    pub id: i64,
    pub path: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// An NVMe-oF port (portal) entry from `nvmet.port.query`.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmeofPort {
    pub id: i64,
    #[serde(rename = "addr_trtype")]
    pub transport: String,
    #[serde(rename = "addr_traddr")]
    pub address: String,
    #[serde(rename = "addr_trsvcid")]
    pub port: u16,
}

/// An NVMe-oF subsystem entry from `nvmet.subsys.query`.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmeofSubsystem {
    pub id: i64,
    pub name: String,
    pub subnqn: String,
}

/// Subsystem reference embedded in a namespace entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceSubsys {
    pub id: i64,
    #[serde(default)]
    pub subnqn: Option<String>,
}

/// An NVMe-oF namespace entry from `nvmet.namespace.query`.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmeofNamespace {
    pub id: i64,
    #[serde(default)]
    pub nsid: Option<u32>,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub device_nguid: Option<String>,
    #[serde(default)]
    pub device_uuid: Option<String>,
    #[serde(default)]
    pub subsys: Option<NamespaceSubsys>,
}

impl NvmeofNamespace {
    /// True when this namespace is backed by the given ZVOL path.
    pub fn backs_zvol(&self, zvol_path: &str) -> bool {
        self.device_path
            .as_deref()
            .is_some_and(|p| p == format!("zvol/{zvol_path}") || p == zvol_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_parse_volume() {
        let raw = r#"{
            "id": "tank/csi/vol1",
            "type": "VOLUME",
            "volsize": {"parsed": 2147483648, "rawvalue": "2147483648"},
            "available": {"parsed": 107374182400},
            "used": {"parsed": 57344}
        }"#;
        let ds: Dataset = serde_json::from_str(raw).unwrap();

        assert_eq!(ds.kind, DatasetKind::Volume);
        assert_eq!(ds.capacity_bytes(), 2147483648);
        assert_eq!(ds.last_component(), "vol1");
    }

    #[test]
    fn test_dataset_parse_filesystem() {
        let raw = r#"{
            "id": "tank/csi/web-data",
            "type": "FILESYSTEM",
            "refquota": {"parsed": 1073741824},
            "mountpoint": "/mnt/tank/csi/web-data"
        }"#;
        let ds: Dataset = serde_json::from_str(raw).unwrap();

        assert_eq!(ds.kind, DatasetKind::Filesystem);
        assert_eq!(ds.capacity_bytes(), 1073741824);
        assert_eq!(ds.mountpoint.as_deref(), Some("/mnt/tank/csi/web-data"));
    }

    #[test]
    fn test_dataset_capacity_unset_is_zero() {
        let raw = r#"{"id": "tank/csi", "type": "FILESYSTEM"}"#;
        let ds: Dataset = serde_json::from_str(raw).unwrap();
        assert_eq!(ds.capacity_bytes(), 0);
    }

    #[test]
    fn test_property_matches_reported_representations() {
        let raw = r#"{
            "id": "tank/csi/vol1",
            "type": "FILESYSTEM",
            "compression": {"parsed": "lz4", "rawvalue": "lz4", "value": "LZ4"},
            "recordsize": {"parsed": 131072, "rawvalue": "131072", "value": "128K"}
        }"#;
        let ds: Dataset = serde_json::from_str(raw).unwrap();

        // Case-insensitive string match against any representation
        assert_eq!(
            ds.property_matches("compression", &serde_json::json!("LZ4")),
            Some(true)
        );
        assert_eq!(
            ds.property_matches("compression", &serde_json::json!("lz4")),
            Some(true)
        );
        assert_eq!(
            ds.property_matches("compression", &serde_json::json!("OFF")),
            Some(false)
        );

        // Size properties match by human-readable value or raw number
        assert_eq!(
            ds.property_matches("recordsize", &serde_json::json!("128K")),
            Some(true)
        );
        assert_eq!(
            ds.property_matches("recordsize", &serde_json::json!(131072)),
            Some(true)
        );
        assert_eq!(
            ds.property_matches("recordsize", &serde_json::json!("64K")),
            Some(false)
        );
    }

    #[test]
    fn test_property_matches_unreported_is_unknown() {
        let raw = r#"{"id": "tank/csi/vol1", "type": "FILESYSTEM"}"#;
        let ds: Dataset = serde_json::from_str(raw).unwrap();

        assert_eq!(
            ds.property_matches("compression", &serde_json::json!("LZ4")),
            None
        );
    }

    #[test]
    fn test_snapshot_creation_time() {
        let raw = r#"{
            "id": "tank/csi/vol1@snap1",
            "dataset": "tank/csi/vol1",
            "snapshot_name": "snap1",
            "properties": {"creation": {"parsed": 1721744461}}
        }"#;
        let snap: ZfsSnapshot = serde_json::from_str(raw).unwrap();

        assert_eq!(snap.creation_unix(), Some(1721744461));
    }

    #[test]
    fn test_snapshot_without_properties() {
        let raw = r#"{
            "id": "tank/csi/vol1@snap1",
            "dataset": "tank/csi/vol1",
            "snapshot_name": "snap1"
        }"#;
        let snap: ZfsSnapshot = serde_json::from_str(raw).unwrap();

        assert_eq!(snap.creation_unix(), None);
    }

    #[test]
    fn test_nvmeof_port_parse() {
        let raw = r#"{
            "id": 1,
            "addr_trtype": "TCP",
            "addr_traddr": "192.0.2.10",
            "addr_trsvcid": 4420
        }"#;
        let port: NvmeofPort = serde_json::from_str(raw).unwrap();

        assert_eq!(port.transport, "TCP");
        assert_eq!(port.address, "192.0.2.10");
        assert_eq!(port.port, 4420);
    }

    #[test]
    fn test_namespace_backs_zvol() {
        let raw = r#"{
            "id": 3,
            "nsid": 1,
            "device_path": "zvol/tank/csi/vol1",
            "device_nguid": "6e3a4c5d6f708192a3b4c5d6e7f80910"
        }"#;
        let ns: NvmeofNamespace = serde_json::from_str(raw).unwrap();

        assert!(ns.backs_zvol("tank/csi/vol1"));
        assert!(!ns.backs_zvol("tank/csi/vol2"));
    }

    #[test]
    fn test_nfs_share_enabled_defaults_true() {
        let raw = r#"{"id": 9, "path": "/mnt/tank/csi/vol1"}"#;
        let share: NfsShare = serde_json::from_str(raw).unwrap();

        assert!(share.enabled);
        assert!(share.networks.is_empty());
    }
}
