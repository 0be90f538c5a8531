//! The fixed four-partition GPT layout and the device-name arithmetic
//! around it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::info;
use regex::Regex;

use nbc_api::config::Slot;
use nbc_api::constants::{
    ESP_LABEL, ESP_SIZE_MIB, ESP_TYPE_CODE, LINUX_TYPE_CODE, ROOT1_LABEL, ROOT2_LABEL,
    ROOT_SIZE_MIB, VAR_LABEL,
};
use nbc_api::error::{
    InvalidInputError, IoFailedError, NbcError, NbcResult, NotFoundError, ReportError,
};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;
use osutils::lsblk::{self, BlockDevice};

/// The four partitions nbc manages, resolved to device paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScheme {
    pub disk: PathBuf,
    pub esp: PathBuf,
    pub root1: PathBuf,
    pub root2: PathBuf,
    pub var: PathBuf,
}

impl PartitionScheme {
    /// Derives the partition paths for a disk from its naming convention.
    pub fn for_disk(disk: impl AsRef<Path>) -> NbcResult<Self> {
        let disk = disk.as_ref();
        Ok(PartitionScheme {
            disk: disk.to_owned(),
            esp: partition_path(disk, 1)?,
            root1: partition_path(disk, 2)?,
            root2: partition_path(disk, 3)?,
            var: partition_path(disk, 4)?,
        })
    }

    pub fn root_for(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.root1,
            Slot::B => &self.root2,
        }
    }

    /// Which slot a root partition path belongs to, if any.
    pub fn slot_of(&self, partition: &Path) -> Option<Slot> {
        if partition == self.root1 {
            Some(Slot::A)
        } else if partition == self.root2 {
            Some(Slot::B)
        } else {
            None
        }
    }
}

/// Builds the path of partition `number` on `disk`. Devices whose name ends
/// in a digit (nvme0n1, mmcblk0, loop0) get a `p` separator.
pub fn partition_path(disk: &Path, number: u32) -> NbcResult<PathBuf> {
    let name = device_name(disk)?;
    let separator = if name.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    Ok(PathBuf::from(format!("/dev/{name}{separator}{number}")))
}

/// Derives the parent disk of a partition device, e.g. `nvme0n1p3` →
/// `/dev/nvme0n1`, `sda3` → `/dev/sda`.
pub fn parent_disk(partition: &Path) -> NbcResult<PathBuf> {
    let name = device_name(partition)?;

    // Devices with a numbered base name require the pN suffix.
    let numbered = Regex::new(r"^(nvme\d+n\d+|mmcblk\d+|loop\d+)(?:p(\d+))?$").unwrap();
    if let Some(captures) = numbered.captures(&name) {
        if captures.get(2).is_none() {
            return Err(unrecognized(&name));
        }
        return Ok(PathBuf::from(format!("/dev/{}", &captures[1])));
    }

    // Traditional names: strip the trailing partition number.
    let plain = Regex::new(r"^([a-z]+)(\d+)$").unwrap();
    match plain.captures(&name) {
        Some(captures) => Ok(PathBuf::from(format!("/dev/{}", &captures[1]))),
        None => Err(unrecognized(&name)),
    }
}

fn device_name(device: &Path) -> NbcResult<String> {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| unrecognized(&device.display().to_string()))
}

fn unrecognized(device: &str) -> NbcError {
    NbcError::new(InvalidInputError::UnrecognizedDeviceName {
        device: device.to_owned(),
    })
}

/// Writes the fixed GPT layout: 2 GiB ESP, two 12 GiB roots, var with the
/// remainder. Root and var use the generic Linux type code on purpose; slot
/// selection is explicit via the kernel cmdline, never auto-discovered.
pub fn create_partitions(adapter: &dyn OsAdapter, disk: &Path) -> NbcResult<PartitionScheme> {
    info!("Creating partition layout on '{}'", disk.display());

    adapter
        .run_checked(Dependency::Sgdisk, &cmd_args!["--zap-all", disk])
        .structured(IoFailedError::CreatePartitions {
            device: disk.to_owned(),
        })?;

    adapter
        .run_checked(
            Dependency::Sgdisk,
            &cmd_args![
                format!("--new=1:0:+{ESP_SIZE_MIB}MiB"),
                format!("--typecode=1:{ESP_TYPE_CODE}"),
                format!("--change-name=1:{ESP_LABEL}"),
                format!("--new=2:0:+{ROOT_SIZE_MIB}MiB"),
                format!("--typecode=2:{LINUX_TYPE_CODE}"),
                format!("--change-name=2:{ROOT1_LABEL}"),
                format!("--new=3:0:+{ROOT_SIZE_MIB}MiB"),
                format!("--typecode=3:{LINUX_TYPE_CODE}"),
                format!("--change-name=3:{ROOT2_LABEL}"),
                "--new=4:0:0",
                format!("--typecode=4:{LINUX_TYPE_CODE}"),
                format!("--change-name=4:{VAR_LABEL}"),
                disk
            ],
        )
        .structured(IoFailedError::CreatePartitions {
            device: disk.to_owned(),
        })?;

    // Give the kernel and udev a chance to create the partition nodes.
    adapter
        .run_checked(Dependency::Partprobe, &cmd_args![disk])
        .structured(IoFailedError::CreatePartitions {
            device: disk.to_owned(),
        })?;
    adapter
        .run_checked(Dependency::Udevadm, &cmd_args!["settle"])
        .structured(IoFailedError::CreatePartitions {
            device: disk.to_owned(),
        })?;

    PartitionScheme::for_disk(disk)
}

/// Reads the GPT of `disk` and returns the scheme when all four labels are
/// present.
pub fn detect_existing_scheme(disk: &Path) -> NbcResult<PartitionScheme> {
    let device = lsblk::get(disk)
        .context("Failed to inspect disk")
        .structured(IoFailedError::Read {
            path: disk.to_owned(),
        })?;
    scheme_from_lsblk(&device)
}

/// Pure half of detection, over an already-parsed lsblk report.
pub fn scheme_from_lsblk(disk: &BlockDevice) -> NbcResult<PartitionScheme> {
    let find = |label: &str| -> NbcResult<PathBuf> {
        disk.children
            .iter()
            .find(|part| part.is_partition() && part.partlabel.as_deref() == Some(label))
            .map(|part| part.path.clone())
            .ok_or_else(|| {
                NbcError::new(NotFoundError::Partition {
                    label: label.to_owned(),
                    device: disk.path.clone(),
                })
            })
    };

    Ok(PartitionScheme {
        disk: disk.path.clone(),
        esp: find(ESP_LABEL)?,
        root1: find(ROOT1_LABEL)?,
        root2: find(ROOT2_LABEL)?,
        var: find(VAR_LABEL)?,
    })
}
