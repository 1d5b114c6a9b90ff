//! Volume model: handles, protocols, and storage-class parameters.
//!
//! The volume handle is the persistent identity the orchestrator carries on
//! every RPC. It encodes the transport protocol, the full backend dataset
//! path, and the per-volume metadata the node service needs, and it must
//! round-trip through parse/encode unchanged.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::str::FromStr;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

// ============================================================================
// Protocol
// ============================================================================

/// Storage transport protocol.
///
/// Determines whether volumes are exported as NFS datasets or NVMe-oF ZVOLs.
/// iSCSI is a declared variant; its paths return `Unimplemented` until the
/// backend support lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// NFS export of a filesystem dataset (default)
    #[default]
    Nfs,
    /// NVMe over Fabrics (TCP) export of a ZVOL
    Nvmeof,
    /// iSCSI export of a ZVOL (declared, not yet implemented)
    Iscsi,
}

impl Protocol {
    /// Default transport port for this protocol.
    pub const fn default_port(self) -> u16 {
        match self {
            Protocol::Nfs => 2049,
            Protocol::Nvmeof => 4420,
            Protocol::Iscsi => 3260,
        }
    }

    /// Whether volumes of this protocol are backed by a ZVOL.
    pub const fn is_block_backed(self) -> bool {
        matches!(self, Protocol::Nvmeof | Protocol::Iscsi)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Nfs => write!(f, "nfs"),
            Protocol::Nvmeof => write!(f, "nvmeof"),
            Protocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nfs" => Ok(Protocol::Nfs),
            "nvmeof" | "nvme" => Ok(Protocol::Nvmeof),
            "iscsi" => Ok(Protocol::Iscsi),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid protocol.
#[derive(Debug, Clone)]
pub struct ProtocolParseError(String);

impl Display for ProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol '{}': expected 'nfs', 'nvmeof', or 'iscsi'",
            self.0
        )
    }
}

impl std::error::Error for ProtocolParseError {}

// ============================================================================
// FsType
// ============================================================================

/// Filesystem type used when formatting block volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    #[default]
    Ext4,
    Xfs,
    Btrfs,
}

impl Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Xfs => write!(f, "xfs"),
            FsType::Btrfs => write!(f, "btrfs"),
        }
    }
}

impl FromStr for FsType {
    type Err = FsTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ext4" | "" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            "btrfs" => Ok(FsType::Btrfs),
            _ => Err(FsTypeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unsupported filesystem type.
#[derive(Debug, Clone)]
pub struct FsTypeParseError(String);

impl Display for FsTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported filesystem '{}': expected 'ext4', 'xfs', or 'btrfs'",
            self.0
        )
    }
}

impl std::error::Error for FsTypeParseError {}

// ============================================================================
// VolumeHandle
// ============================================================================

/// Parsed form of a volume handle.
///
/// Wire format: `<protocol>:<pool>/<parent>/<name>[?k=v&...]`. The trailing
/// query carries the per-volume metadata the node service needs (server
/// address, NVMe-oF NQN, namespace nguid, filesystem type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub protocol: Protocol,
    /// Full backend dataset path, e.g. `tank/csi/pvc-1234`.
    pub dataset: String,
    /// Node-side metadata, ordered for deterministic encoding.
    pub context: BTreeMap<String, String>,
}

/// Error returned when a volume handle cannot be parsed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed volume handle: {0}")]
pub struct HandleParseError(String);

impl VolumeHandle {
    pub fn new(protocol: Protocol, dataset: impl Into<String>) -> Self {
        Self {
            protocol,
            dataset: dataset.into(),
            context: BTreeMap::new(),
        }
    }

    /// Add a context entry. Keys and values must not contain `?`, `&`, `=`.
    pub fn with_context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn context_get(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// The pool the dataset lives in (first path component).
    pub fn pool(&self) -> &str {
        self.dataset.split('/').next().unwrap_or(&self.dataset)
    }

    /// The volume name (last path component).
    pub fn name(&self) -> &str {
        self.dataset.rsplit('/').next().unwrap_or(&self.dataset)
    }

    /// Encode to the wire form carried by the orchestrator.
    pub fn encode(&self) -> String {
        let mut out = format!("{}:{}", self.protocol, self.dataset);
        let mut sep = '?';
        for (k, v) in &self.context {
            out.push(sep);
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            sep = '&';
        }
        out
    }

    /// Parse a handle from its wire form.
    pub fn parse(handle: &str) -> Result<Self, HandleParseError> {
        let (head, query) = match handle.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (handle, None),
        };

        let (proto, dataset) = head
            .split_once(':')
            .ok_or_else(|| HandleParseError(format!("'{handle}' has no protocol prefix")))?;

        let protocol: Protocol = proto
            .parse()
            .map_err(|e: ProtocolParseError| HandleParseError(e.to_string()))?;

        if dataset.is_empty() || dataset.starts_with('/') || dataset.ends_with('/') {
            return Err(HandleParseError(format!(
                "'{handle}' has a malformed dataset path"
            )));
        }

        let mut context = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| HandleParseError(format!("bad query pair '{pair}'")))?;
                context.insert(k.to_string(), v.to_string());
            }
        }

        Ok(Self {
            protocol,
            dataset: dataset.to_string(),
            context,
        })
    }
}

// Context keys carried in the handle query.
pub mod context_keys {
    pub const SERVER: &str = "server";
    pub const PORT: &str = "port";
    pub const NQN: &str = "nqn";
    pub const NGUID: &str = "nguid";
    pub const NSID: &str = "nsid";
    pub const FS_TYPE: &str = "fsType";
}

// ============================================================================
// Storage-class parameters
// ============================================================================

/// Prefix for parameters applied as native ZFS properties.
pub const ZFS_PROPERTY_PREFIX: &str = "zfs.";

/// Parsed storage-class parameters.
#[derive(Debug, Clone, Default)]
pub struct VolumeParameters {
    pub protocol: Protocol,
    pub pool: Option<String>,
    pub server: Option<String>,
    pub transport: Option<String>,
    pub port: Option<u16>,
    pub subsystem_nqn: Option<String>,
    pub fs_type: FsType,
    pub parent_dataset: Option<String>,
    pub detached_snapshots: bool,
    /// `zfs.*` parameters mapped to middleware dataset properties.
    pub zfs_properties: Map<String, Value>,
}

impl VolumeParameters {
    /// Parse the parameter map from a StorageClass / VolumeSnapshotClass.
    pub fn from_map(parameters: &HashMap<String, String>) -> Result<Self, String> {
        let mut out = VolumeParameters::default();

        for (key, value) in parameters {
            match key.as_str() {
                "protocol" => {
                    out.protocol = value.parse().map_err(|e: ProtocolParseError| e.to_string())?;
                }
                "pool" => out.pool = Some(value.clone()),
                "server" => out.server = Some(value.clone()),
                "transport" => out.transport = Some(value.clone()),
                "port" => {
                    out.port = Some(
                        value
                            .parse()
                            .map_err(|_| format!("invalid port '{value}'"))?,
                    );
                }
                "subsystemNQN" | "subsystemNqn" => out.subsystem_nqn = Some(value.clone()),
                "fsType" => {
                    out.fs_type = value.parse().map_err(|e: FsTypeParseError| e.to_string())?;
                }
                "parentDataset" => out.parent_dataset = Some(value.clone()),
                "detachedSnapshots" => {
                    out.detached_snapshots = value
                        .parse()
                        .map_err(|_| format!("invalid boolean '{value}' for detachedSnapshots"))?;
                }
                key if key.starts_with(ZFS_PROPERTY_PREFIX) => {
                    let (prop, mapped) = zfs_property(&key[ZFS_PROPERTY_PREFIX.len()..], value);
                    out.zfs_properties.insert(prop, mapped);
                }
                // Unknown keys are passed through by the orchestrator for
                // other components; ignore them.
                _ => {}
            }
        }

        if out.transport.as_deref().is_some_and(|t| !t.eq_ignore_ascii_case("tcp")) {
            return Err(format!(
                "unsupported transport '{}': only 'tcp' is supported",
                out.transport.unwrap_or_default()
            ));
        }

        Ok(out)
    }
}

/// Map a `zfs.<prop>` storage-class parameter onto a middleware dataset
/// property. Enumerated properties are uppercased the way the middleware
/// expects; size-valued ones pass through verbatim.
fn zfs_property(prop: &str, value: &str) -> (String, Value) {
    match prop {
        "compression" | "dedup" | "sync" | "atime" | "exec" | "snapdir" => {
            (prop.to_string(), json!(value.to_uppercase()))
        }
        _ => (prop.to_string(), json!(value)),
    }
}

// ============================================================================
// Name derivation
// ============================================================================

/// Longest dataset component we derive from an orchestrator-assigned name.
const MAX_COMPONENT_LEN: usize = 63;

/// Hex digits of the name hash appended when truncating.
const HASH_SUFFIX_LEN: usize = 16;

/// Derive a safe, deterministic dataset component from an orchestrator
/// volume/snapshot name.
///
/// Invalid characters are replaced, and names longer than the backend limit
/// are truncated with a hash of the original appended so distinct long names
/// stay distinct.
pub fn safe_component(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized.is_empty() {
        sanitized.push_str("volume");
    }

    if sanitized.len() <= MAX_COMPONENT_LEN {
        return sanitized;
    }

    let digest = Sha256::digest(name.as_bytes());
    let suffix = hex::encode(&digest[..HASH_SUFFIX_LEN / 2]);
    let keep = MAX_COMPONENT_LEN - HASH_SUFFIX_LEN - 1;
    format!("{}-{}", &sanitized[..keep], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("nfs".parse::<Protocol>().unwrap(), Protocol::Nfs);
        assert_eq!("NFS".parse::<Protocol>().unwrap(), Protocol::Nfs);
        assert_eq!("nvmeof".parse::<Protocol>().unwrap(), Protocol::Nvmeof);
        assert_eq!("nvme".parse::<Protocol>().unwrap(), Protocol::Nvmeof);
        assert_eq!("iscsi".parse::<Protocol>().unwrap(), Protocol::Iscsi);
        assert!("smb".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_default_port() {
        assert_eq!(Protocol::Nfs.default_port(), 2049);
        assert_eq!(Protocol::Nvmeof.default_port(), 4420);
        assert_eq!(Protocol::Iscsi.default_port(), 3260);
    }

    #[test]
    fn test_fs_type_from_str() {
        assert_eq!("ext4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("XFS".parse::<FsType>().unwrap(), FsType::Xfs);
        assert_eq!("btrfs".parse::<FsType>().unwrap(), FsType::Btrfs);
        assert!("ufs".parse::<FsType>().is_err());
        assert!("ntfs".parse::<FsType>().is_err());
    }

    #[test]
    fn test_handle_roundtrip_plain() {
        let handle = VolumeHandle::new(Protocol::Nfs, "tank/csi/vol1");
        let encoded = handle.encode();
        assert_eq!(encoded, "nfs:tank/csi/vol1");

        let parsed = VolumeHandle::parse(&encoded).unwrap();
        assert_eq!(parsed, handle);
        assert_eq!(parsed.pool(), "tank");
        assert_eq!(parsed.name(), "vol1");
    }

    #[test]
    fn test_handle_roundtrip_with_context() {
        let handle = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/vol2")
            .with_context(context_keys::SERVER, "192.0.2.10")
            .with_context(context_keys::PORT, "4420")
            .with_context(context_keys::NQN, "nqn.2005-03.org.truenas:csi-test")
            .with_context(context_keys::NGUID, "6e3a4c5d6f708192a3b4c5d6e7f80910");

        let encoded = handle.encode();
        let parsed = VolumeHandle::parse(&encoded).unwrap();

        assert_eq!(parsed, handle);
        assert_eq!(
            parsed.context_get(context_keys::NQN),
            Some("nqn.2005-03.org.truenas:csi-test")
        );
        assert_eq!(parsed.context_get(context_keys::PORT), Some("4420"));
    }

    #[test]
    fn test_handle_context_order_is_deterministic() {
        let a = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/v")
            .with_context("b", "2")
            .with_context("a", "1");
        let b = VolumeHandle::new(Protocol::Nvmeof, "tank/csi/v")
            .with_context("a", "1")
            .with_context("b", "2");
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_handle_parse_invalid() {
        assert!(VolumeHandle::parse("").is_err());
        assert!(VolumeHandle::parse("tank/csi/vol1").is_err());
        assert!(VolumeHandle::parse("smb:tank/vol").is_err());
        assert!(VolumeHandle::parse("nfs:").is_err());
        assert!(VolumeHandle::parse("nfs:/tank/vol").is_err());
        assert!(VolumeHandle::parse("nfs:tank/vol?badpair").is_err());
    }

    #[test]
    fn test_parameters_from_map() {
        let mut params = HashMap::new();
        params.insert("protocol".to_string(), "nvmeof".to_string());
        params.insert("server".to_string(), "192.0.2.10".to_string());
        params.insert("port".to_string(), "4420".to_string());
        params.insert(
            "subsystemNQN".to_string(),
            "nqn.2005-03.org.truenas:csi-test".to_string(),
        );
        params.insert("fsType".to_string(), "btrfs".to_string());
        params.insert("detachedSnapshots".to_string(), "true".to_string());
        params.insert("zfs.compression".to_string(), "lz4".to_string());
        params.insert("zfs.volblocksize".to_string(), "16K".to_string());

        let parsed = VolumeParameters::from_map(&params).unwrap();

        assert_eq!(parsed.protocol, Protocol::Nvmeof);
        assert_eq!(parsed.server.as_deref(), Some("192.0.2.10"));
        assert_eq!(parsed.port, Some(4420));
        assert_eq!(parsed.fs_type, FsType::Btrfs);
        assert!(parsed.detached_snapshots);
        assert_eq!(parsed.zfs_properties.get("compression"), Some(&json!("LZ4")));
        assert_eq!(parsed.zfs_properties.get("volblocksize"), Some(&json!("16K")));
    }

    #[test]
    fn test_parameters_defaults() {
        let parsed = VolumeParameters::from_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.protocol, Protocol::Nfs);
        assert_eq!(parsed.fs_type, FsType::Ext4);
        assert!(!parsed.detached_snapshots);
        assert!(parsed.zfs_properties.is_empty());
    }

    #[test]
    fn test_parameters_reject_bad_values() {
        let mut params = HashMap::new();
        params.insert("protocol".to_string(), "fcoe".to_string());
        assert!(VolumeParameters::from_map(&params).is_err());

        let mut params = HashMap::new();
        params.insert("port".to_string(), "not-a-port".to_string());
        assert!(VolumeParameters::from_map(&params).is_err());

        let mut params = HashMap::new();
        params.insert("transport".to_string(), "rdma".to_string());
        assert!(VolumeParameters::from_map(&params).is_err());
    }

    #[test]
    fn test_safe_component_passthrough() {
        assert_eq!(safe_component("pvc-1234-abcd"), "pvc-1234-abcd");
        assert_eq!(safe_component("my.volume_1"), "my.volume_1");
    }

    #[test]
    fn test_safe_component_sanitizes() {
        assert_eq!(safe_component("my volume/one"), "my-volume-one");
        assert_eq!(safe_component(""), "volume");
    }

    #[test]
    fn test_safe_component_truncates_deterministically() {
        let long_a = "a".repeat(100);
        let long_b = format!("{}b", "a".repeat(100));

        let comp_a = safe_component(&long_a);
        let comp_b = safe_component(&long_b);

        assert!(comp_a.len() <= 63);
        assert!(comp_b.len() <= 63);
        // Same input, same output
        assert_eq!(comp_a, safe_component(&long_a));
        // Distinct long names stay distinct via the hash suffix
        assert_ne!(comp_a, comp_b);
    }
}
