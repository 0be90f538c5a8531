//! Boot-device introspection: which disk we booted from, which slot is
//! active, and whether the disk is still the one recorded at install time.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, warn};

use nbc_api::config::Slot;
use nbc_api::error::{IoFailedError, NbcError, NbcResult, NotFoundError, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;

use crate::storage::partitioning::{parent_disk, PartitionScheme};

/// The `root=` argument of a kernel cmdline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootArg {
    Uuid(String),
    Device(PathBuf),
}

/// Extracts `root=` from a kernel cmdline.
pub fn parse_root_arg(cmdline: &str) -> Option<RootArg> {
    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("root=") {
            if let Some(uuid) = value.strip_prefix("UUID=") {
                return Some(RootArg::Uuid(uuid.to_owned()));
            }
            return Some(RootArg::Device(PathBuf::from(value)));
        }
    }
    None
}

/// Pulls the backing device out of `cryptsetup status` output.
pub fn parse_cryptsetup_status(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("device:"))
        .map(|device| PathBuf::from(device.trim()))
}

/// Where the running system booted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootDevice {
    /// The partition (or LUKS backing partition) holding the active root.
    pub root_partition: PathBuf,
    /// Its parent disk.
    pub disk: PathBuf,
    /// The mapper name when the root came up through device-mapper.
    pub mapper: Option<String>,
}

/// Resolves the active root partition and disk from the kernel cmdline.
pub fn detect_boot_device(adapter: &dyn OsAdapter) -> NbcResult<BootDevice> {
    let cmdline = std::fs::read_to_string("/proc/cmdline")
        .context("Failed to read /proc/cmdline")
        .structured(IoFailedError::Read {
            path: PathBuf::from("/proc/cmdline"),
        })?;
    detect_from_cmdline(adapter, &cmdline)
}

/// Testable half of [`detect_boot_device`].
pub fn detect_from_cmdline(adapter: &dyn OsAdapter, cmdline: &str) -> NbcResult<BootDevice> {
    let root = parse_root_arg(cmdline)
        .ok_or_else(|| NbcError::new(NotFoundError::RootCmdlineArgument))?;

    let (device, mapper) = match root {
        RootArg::Uuid(uuid) => {
            let by_uuid = PathBuf::from(format!("/dev/disk/by-uuid/{uuid}"));
            let device = std::fs::canonicalize(&by_uuid)
                .with_context(|| format!("Failed to resolve '{}'", by_uuid.display()))
                .structured(NotFoundError::Device { path: by_uuid })?;
            (device, None)
        }
        RootArg::Device(path) => {
            if let Some(name) = mapper_name(&path) {
                let status = adapter
                    .run_output(Dependency::Cryptsetup, &cmd_args!["status", &name])
                    .structured(IoFailedError::Read { path: path.clone() })?;
                let backing = parse_cryptsetup_status(&status).ok_or_else(|| {
                    NbcError::new(NotFoundError::Device { path: path.clone() })
                })?;
                (backing, Some(name))
            } else {
                (path, None)
            }
        }
    };

    let disk = parent_disk(&device)?;
    debug!(
        "Boot device: root partition '{}' on disk '{}'",
        device.display(),
        disk.display()
    );
    Ok(BootDevice {
        root_partition: device,
        disk,
        mapper,
    })
}

/// The active slot: from the mapper name on encrypted systems, from the
/// partition path otherwise.
pub fn active_slot(boot: &BootDevice, scheme: &PartitionScheme) -> NbcResult<Slot> {
    if let Some(mapper) = &boot.mapper {
        if let Some(slot) = Slot::from_root_label(mapper) {
            return Ok(slot);
        }
    }
    scheme.slot_of(&boot.root_partition).ok_or_else(|| {
        NbcError::new(NotFoundError::Partition {
            label: "root1/root2".into(),
            device: boot.root_partition.clone(),
        })
    })
}

fn mapper_name(path: &Path) -> Option<String> {
    path.strip_prefix("/dev/mapper")
        .ok()
        .map(|n| n.to_string_lossy().into_owned())
}

/// The stable `/dev/disk/by-id` name of a disk, preferring wwn entries the
/// way the by-id directory itself orders identities.
pub fn disk_id_of(disk: &Path) -> Option<String> {
    let mut ids: Vec<String> = Vec::new();
    for entry in glob::glob("/dev/disk/by-id/*").ok()? {
        let Ok(path) = entry else { continue };
        let name = path.file_name()?.to_string_lossy().into_owned();
        if name.contains("-part") {
            continue;
        }
        if let Ok(resolved) = std::fs::canonicalize(&path) {
            if resolved == disk {
                ids.push(name);
            }
        }
    }
    ids.sort();
    ids.into_iter().next()
}

/// Compares a recorded disk-id against the disk we actually booted from.
/// A mismatch is a user-visible anomaly (disk replacement), not an error.
pub fn verify_disk_id(disk: &Path, recorded: Option<&str>) {
    let Some(recorded) = recorded else { return };
    match disk_id_of(disk) {
        Some(current) if current == recorded => {}
        Some(current) => warn!(
            "Disk id of '{}' is '{current}', but '{recorded}' was recorded at install time",
            disk.display()
        ),
        None => warn!(
            "No /dev/disk/by-id entry found for '{}' (recorded id '{recorded}')",
            disk.display()
        ),
    }
}
