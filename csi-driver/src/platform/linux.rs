//! Linux platform implementation for CSI Node operations
//!
//! Uses Linux-specific tools:
//! - nvme for NVMe-oF (nvme-cli)
//! - mkfs.ext4/mkfs.xfs/mkfs.btrfs for filesystem formatting
//! - resize2fs/xfs_growfs/btrfs for online filesystem growth
//! - mount --bind for bind mounts

use std::fs;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tonic::Status;
use tracing::{debug, error, info, warn};

use super::PlatformResult;
use crate::volume::FsType;

/// Poll cadence while waiting for a connected namespace to surface in sysfs.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const NVME_SUBSYS_SYSFS: &str = "/sys/class/nvme-subsystem";

/// Run an external command, mapping spawn failures to Internal.
async fn run(program: &str, args: &[&str]) -> PlatformResult<std::process::Output> {
    Command::new(program).args(args).output().await.map_err(|e| {
        error!(error = %e, program = %program, "Failed to execute command");
        Status::internal(format!("Failed to execute {program}: {e}"))
    })
}

// ============================================================================
// NVMe-oF discovery and connection
// ============================================================================

/// Check if an NVMe-oF subsystem is currently connected on this node.
pub fn is_nvmeof_connected(target_nqn: &str) -> bool {
    subsystem_sysfs_dir(target_nqn).is_some()
}

/// Connect to an NVMe-oF target over TCP.
///
/// Runs fabric discovery against the portal first; a target that does not
/// advertise the subsystem is surfaced as FailedPrecondition rather than a
/// connect error. Already-connected is success.
pub async fn connect_nvmeof(target_nqn: &str, addr: &str, port: &str) -> PlatformResult<()> {
    if is_nvmeof_connected(target_nqn) {
        debug!(target_nqn = %target_nqn, "NVMe-oF subsystem already connected");
        return Ok(());
    }

    info!(target_nqn = %target_nqn, addr = %addr, port = %port, "Connecting to NVMe-oF target");

    let discover = run("nvme", &["discover", "-t", "tcp", "-a", addr, "-s", port]).await?;
    if discover.status.success() {
        let stdout = String::from_utf8_lossy(&discover.stdout);
        if !stdout.contains(target_nqn) {
            return Err(Status::failed_precondition(format!(
                "portal {addr}:{port} does not advertise subsystem {target_nqn}"
            )));
        }
    } else {
        let stderr = String::from_utf8_lossy(&discover.stderr);
        warn!(stderr = %stderr, addr = %addr, "nvme discover failed (continuing with connect)");
    }

    let output = run(
        "nvme",
        &["connect", "-t", "tcp", "-a", addr, "-s", port, "-n", target_nqn],
    )
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already connected") {
            info!(target_nqn = %target_nqn, "NVMe-oF target already connected");
            return Ok(());
        }
        error!(stderr = %stderr, "nvme connect failed");
        return Err(Status::internal(format!("nvme connect failed: {stderr}")));
    }

    info!(target_nqn = %target_nqn, addr = %addr, "NVMe-oF connect successful");
    Ok(())
}

/// Disconnect from an NVMe-oF subsystem. Not-connected is success.
pub async fn disconnect_nvmeof(target_nqn: &str) -> PlatformResult<()> {
    info!(target_nqn = %target_nqn, "Disconnecting from NVMe-oF target");

    let output = run("nvme", &["disconnect", "-n", target_nqn]).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("No subsystem") {
            warn!(target_nqn = %target_nqn, "NVMe-oF target was not connected");
            return Ok(());
        }
        error!(stderr = %stderr, "nvme disconnect failed");
        return Err(Status::internal(format!(
            "nvme disconnect failed: {stderr}"
        )));
    }

    Ok(())
}

/// Wait until the namespace device of a connected subsystem appears and
/// return its `/dev` path.
///
/// The device is identified by matching the namespace `nguid` recorded at
/// provisioning time; without one, a single-namespace subsystem is
/// unambiguous and its device is returned directly.
pub async fn wait_for_nvmeof_device(
    target_nqn: &str,
    nguid: Option<&str>,
    deadline: Duration,
) -> PlatformResult<String> {
    let started = Instant::now();

    loop {
        if let Some(device) = find_nvmeof_device(target_nqn, nguid) {
            info!(target_nqn = %target_nqn, device = %device, "NVMe-oF namespace device found");
            return Ok(device);
        }

        if started.elapsed() >= deadline {
            return Err(Status::deadline_exceeded(format!(
                "namespace device for {target_nqn} did not appear within {deadline:?}"
            )));
        }

        sleep(DEVICE_POLL_INTERVAL).await;
    }
}

/// Find the sysfs directory of a connected subsystem by NQN.
fn subsystem_sysfs_dir(target_nqn: &str) -> Option<std::path::PathBuf> {
    let entries = fs::read_dir(NVME_SUBSYS_SYSFS).ok()?;
    for entry in entries.flatten() {
        let nqn_path = entry.path().join("subsysnqn");
        if let Ok(nqn) = fs::read_to_string(&nqn_path)
            && nqn.trim() == target_nqn
        {
            return Some(entry.path());
        }
    }
    None
}

/// Locate the namespace block device of a connected subsystem.
fn find_nvmeof_device(target_nqn: &str, nguid: Option<&str>) -> Option<String> {
    let subsys_dir = subsystem_sysfs_dir(target_nqn)?;

    let mut namespaces = Vec::new();
    for entry in fs::read_dir(&subsys_dir).ok()?.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy().to_string();
        // Only namespace devices like nvme0n1, not controller devices like nvme0
        if is_nvme_namespace_device(&name_str) {
            namespaces.push((name_str, entry.path()));
        }
    }

    if let Some(expected) = nguid {
        let expected = normalize_nguid(expected);
        for (name, path) in &namespaces {
            if let Ok(found) = fs::read_to_string(path.join("nguid"))
                && normalize_nguid(found.trim()) == expected
            {
                return Some(format!("/dev/{name}"));
            }
        }
        // The nguid attribute is not exposed on some older kernels; fall
        // through to the single-namespace case.
    }

    if namespaces.len() == 1 {
        return Some(format!("/dev/{}", namespaces[0].0));
    }

    None
}

/// Number of namespace devices this node currently sees for a subsystem.
///
/// Used to decide whether NodeUnstage should disconnect the fabric session.
pub fn connected_namespace_count(target_nqn: &str) -> usize {
    let Some(subsys_dir) = subsystem_sysfs_dir(target_nqn) else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(&subsys_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| is_nvme_namespace_device(&e.file_name().to_string_lossy()))
        .count()
}

/// Check if a device name is an NVMe namespace device (nvmeXnY) not just a
/// controller (nvmeX).
fn is_nvme_namespace_device(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);

    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };

    let mut chars = rest.chars().peekable();

    // Controller number
    if !chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
    }

    // 'n' then namespace number
    if chars.next() != Some('n') {
        return false;
    }
    if !chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
    }

    chars.next().is_none()
}

/// Normalize an nguid for comparison (case and hyphen insensitive).
fn normalize_nguid(nguid: &str) -> String {
    nguid
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ============================================================================
// Filesystem operations
// ============================================================================

/// Format a device with the specified filesystem type.
pub async fn format_device(device: &str, fs_type: FsType) -> PlatformResult<()> {
    info!(device = %device, fs_type = %fs_type, "Formatting device");

    let (program, args): (&str, Vec<&str>) = match fs_type {
        // -F / -f to force (don't prompt on a non-interactive run)
        FsType::Ext4 => ("mkfs.ext4", vec!["-F", device]),
        FsType::Xfs => ("mkfs.xfs", vec!["-f", device]),
        FsType::Btrfs => ("mkfs.btrfs", vec!["-f", device]),
    };

    let output = run(program, &args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{program} failed");
        return Err(Status::internal(format!("{program} failed: {stderr}")));
    }

    Ok(())
}

/// Check if a device needs formatting (has no filesystem signature).
pub async fn needs_formatting(device: &str) -> PlatformResult<bool> {
    let output = run("blkid", &["-p", device]).await?;

    // blkid returns non-zero if no signature was found
    if !output.status.success() {
        return Ok(true);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(!stdout.contains("TYPE="))
}

/// Detect the filesystem type on a device, if any.
pub async fn detect_fs_type(device: &str) -> PlatformResult<Option<String>> {
    let output = run("blkid", &["-p", "-o", "value", "-s", "TYPE", device]).await?;

    if !output.status.success() {
        return Ok(None);
    }

    let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if fs.is_empty() { None } else { Some(fs) })
}

/// Grow a mounted filesystem to the size of its underlying device.
pub async fn expand_filesystem(
    device: &str,
    mountpoint: &str,
    fs_type: FsType,
) -> PlatformResult<()> {
    info!(device = %device, mountpoint = %mountpoint, fs_type = %fs_type, "Expanding filesystem");

    let (program, args): (&str, Vec<&str>) = match fs_type {
        FsType::Ext4 => ("resize2fs", vec![device]),
        FsType::Xfs => ("xfs_growfs", vec![mountpoint]),
        FsType::Btrfs => ("btrfs", vec!["filesystem", "resize", "max", mountpoint]),
    };

    let output = run(program, &args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{program} failed");
        return Err(Status::internal(format!(
            "filesystem expansion failed: {stderr}"
        )));
    }

    Ok(())
}

// ============================================================================
// Mounts
// ============================================================================

/// Ensure a directory exists.
pub fn ensure_dir(path: &str) -> PlatformResult<()> {
    fs::create_dir_all(path).map_err(|e| {
        error!(error = %e, path = %path, "Failed to create directory");
        Status::internal(format!("Failed to create directory {path}: {e}"))
    })
}

/// Ensure a plain file exists (bind-mount target for raw block volumes).
pub fn ensure_file(path: &str) -> PlatformResult<()> {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Status::internal(format!("Failed to create directory {}: {e}", parent.display()))
        })?;
    }
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| {
            error!(error = %e, path = %path, "Failed to create bind target file");
            Status::internal(format!("Failed to create file {path}: {e}"))
        })?;
    Ok(())
}

/// Mount a block device to a target path.
pub async fn mount_device(
    device: &str,
    target: &str,
    fs_type: FsType,
    options: &[String],
) -> PlatformResult<()> {
    info!(device = %device, target = %target, fs_type = %fs_type, "Mounting device");

    ensure_dir(target)?;

    let fs = fs_type.to_string();
    let mut args = vec!["-t", fs.as_str()];
    let opts = options.join(",");
    if !opts.is_empty() {
        args.push("-o");
        args.push(&opts);
    }
    args.push(device);
    args.push(target);

    let output = run("mount", &args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "mount failed");
        return Err(Status::internal(format!("mount failed: {stderr}")));
    }

    Ok(())
}

/// Mount an NFS export to a target path.
pub async fn mount_nfs(export: &str, target: &str, options: &[String]) -> PlatformResult<()> {
    info!(export = %export, target = %target, "Mounting NFS export");

    ensure_dir(target)?;

    let mut args = vec!["-t", "nfs"];
    let opts = options.join(",");
    if !opts.is_empty() {
        args.push("-o");
        args.push(&opts);
    }
    args.push(export);
    args.push(target);

    let output = run("mount", &args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "NFS mount failed");
        return Err(Status::internal(format!("NFS mount failed: {stderr}")));
    }

    Ok(())
}

/// Create a bind mount, optionally remounting read-only.
pub async fn bind_mount(source: &str, target: &str, readonly: bool) -> PlatformResult<()> {
    info!(source = %source, target = %target, readonly, "Creating bind mount");

    let output = run("mount", &["--bind", source, target]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "bind mount failed");
        return Err(Status::internal(format!("bind mount failed: {stderr}")));
    }

    if readonly {
        let output = run("mount", &["-o", "remount,bind,ro", target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "read-only remount failed");
            return Err(Status::internal(format!(
                "read-only remount failed: {stderr}"
            )));
        }
    }

    Ok(())
}

/// Unmount a path. Not-mounted is success.
pub async fn unmount(target: &str) -> PlatformResult<()> {
    if !is_mounted(target)? {
        debug!(target = %target, "Path is not mounted, skipping unmount");
        return Ok(());
    }

    info!(target = %target, "Unmounting");

    let output = run("umount", &[target]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(target = %target, "Path was not mounted");
            return Ok(());
        }
        error!(stderr = %stderr, "umount failed");
        return Err(Status::internal(format!("umount failed: {stderr}")));
    }

    Ok(())
}

/// Check if a path is currently a mount point.
pub fn is_mounted(target: &str) -> PlatformResult<bool> {
    let mounts = fs::read_to_string("/proc/mounts").map_err(|e| {
        error!(error = %e, "Failed to read /proc/mounts");
        Status::internal(format!("Failed to read mount table: {e}"))
    })?;

    Ok(mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(target)))
}

/// Capacity statistics of a mounted filesystem: (total, used, available)
/// in bytes.
pub async fn volume_stats(path: &str) -> PlatformResult<(i64, i64, i64)> {
    let output = run("df", &["-P", "-k", path]).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Status::internal(format!("df failed: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| Status::internal("df produced no data line"))?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Status::internal(format!("unexpected df output: {line}")));
    }

    let parse = |s: &str| -> PlatformResult<i64> {
        s.parse::<i64>()
            .map(|kb| kb * 1024)
            .map_err(|_| Status::internal(format!("unparseable df field '{s}'")))
    };

    Ok((parse(fields[1])?, parse(fields[2])?, parse(fields[3])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_nvme_namespace_device() {
        // Valid namespace devices
        assert!(is_nvme_namespace_device("/dev/nvme0n1"));
        assert!(is_nvme_namespace_device("nvme1n2"));
        assert!(is_nvme_namespace_device("nvme10n15"));

        // Controller devices are not namespaces
        assert!(!is_nvme_namespace_device("/dev/nvme0"));
        assert!(!is_nvme_namespace_device("nvme1"));

        // Other formats
        assert!(!is_nvme_namespace_device("/dev/sda"));
        assert!(!is_nvme_namespace_device("nvme"));
        assert!(!is_nvme_namespace_device(""));
        assert!(!is_nvme_namespace_device("nvme0n"));
        assert!(!is_nvme_namespace_device("nvme0n1p2"));
    }

    #[test]
    fn test_normalize_nguid() {
        assert_eq!(
            normalize_nguid("6E3A4C5D-6F70-8192-A3B4-C5D6E7F80910"),
            "6e3a4c5d6f708192a3b4c5d6e7f80910"
        );
        assert_eq!(
            normalize_nguid("6e3a4c5d6f708192a3b4c5d6e7f80910"),
            "6e3a4c5d6f708192a3b4c5d6e7f80910"
        );
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        let nested_str = nested.to_string_lossy();

        ensure_dir(&nested_str).unwrap();
        assert!(nested.is_dir());

        // Second call is a no-op
        ensure_dir(&nested_str).unwrap();
    }

    #[test]
    fn test_ensure_file_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("pods/vol/block");
        let file_str = file.to_string_lossy();

        ensure_file(&file_str).unwrap();
        assert!(file.is_file());

        // Second call leaves the file in place
        ensure_file(&file_str).unwrap();
        assert!(file.is_file());
    }

    #[test]
    fn test_is_mounted_root() {
        // The root filesystem is always a mount point
        assert!(is_mounted("/").unwrap());
        assert!(!is_mounted("/definitely/not/a/mountpoint").unwrap());
    }
}
