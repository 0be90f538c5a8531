use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;

/// One of the two root slots. Exactly one is active per boot, determined by
/// the kernel cmdline `root=` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Partition label and LUKS mapper name of this slot's root.
    pub fn root_label(self) -> &'static str {
        match self {
            Slot::A => crate::constants::ROOT1_LABEL,
            Slot::B => crate::constants::ROOT2_LABEL,
        }
    }

    pub fn from_root_label(label: &str) -> Option<Slot> {
        match label {
            l if l == crate::constants::ROOT1_LABEL => Some(Slot::A),
            l if l == crate::constants::ROOT2_LABEL => Some(Slot::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => f.write_str("A"),
            Slot::B => f.write_str("B"),
        }
    }
}

/// Filesystem used for root and var partitions. The ESP is always FAT32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Ext4,
    #[default]
    Btrfs,
}

impl FilesystemType {
    pub fn name(self) -> &'static str {
        match self {
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Btrfs => "btrfs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderType {
    Grub2,
    #[default]
    SystemdBoot,
}

/// One LUKS2 volume of an encrypted installation. The LUKS UUID is the stable
/// identity used in crypttab, fstab, and the kernel cmdline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuksVolumeRecord {
    pub mapper: String,
    pub luks_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub tpm2: bool,
    pub volumes: Vec<LuksVolumeRecord>,
}

/// The system configuration record at `/var/lib/nbc/state/config.json`.
///
/// `image_digest` refers to the image installed on the slot that becomes
/// active on next boot; `boot-confirm` reconciles the bootloader default with
/// it after a successful boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub image_ref: String,
    pub image_digest: Digest,
    pub device: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub disk_id: Option<String>,
    pub install_date: DateTime<Utc>,
    #[serde(default)]
    pub kernel_args: Vec<String>,
    pub bootloader: BootloaderType,
    pub filesystem: FilesystemType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encryption: Option<EncryptionConfig>,
}

/// The image a root filesystem was extracted from, recorded on the root
/// itself (see `constants::IMAGE_MARKER_NAME`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledImage {
    pub image_ref: String,
    pub image_digest: Digest,
}

/// Record written to `/run/nbc-reboot-required` after a staged update.
/// Lives on tmpfs, so a reboot clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootPending {
    pub target_slot: Slot,
    pub image_ref: String,
    pub image_digest: Digest,
    pub update_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_digest() -> Digest {
        Digest::parse(&format!("sha256:{}", "ab".repeat(32))).unwrap()
    }

    fn sample_config() -> SystemConfig {
        SystemConfig {
            image_ref: "ghcr.io/test/bootc:v1".into(),
            image_digest: sample_digest(),
            device: "/dev/sda".into(),
            disk_id: Some("wwn-0x5000c500a1b2c3d4".into()),
            install_date: "2026-02-01T12:00:00Z".parse().unwrap(),
            kernel_args: vec!["console=ttyS0".into()],
            bootloader: BootloaderType::SystemdBoot,
            filesystem: FilesystemType::Btrfs,
            encryption: None,
        }
    }

    #[test]
    fn test_config_roundtrip() {
        let config = sample_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: SystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_absent_encryption_omitted() {
        let json = serde_json::to_string(&sample_config()).unwrap();
        assert!(!json.contains("encryption"));

        let encrypted = SystemConfig {
            encryption: Some(EncryptionConfig {
                tpm2: true,
                volumes: vec![LuksVolumeRecord {
                    mapper: "root1".into(),
                    luks_uuid: Uuid::nil(),
                }],
            }),
            ..sample_config()
        };
        let json = serde_json::to_string(&encrypted).unwrap();
        assert!(json.contains("\"tpm2\":true"));
    }

    #[test]
    fn test_slot_labels() {
        assert_eq!(Slot::A.root_label(), "root1");
        assert_eq!(Slot::B.root_label(), "root2");
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::from_root_label("root2"), Some(Slot::B));
        assert_eq!(Slot::from_root_label("var"), None);
    }

    #[test]
    fn test_reboot_pending_roundtrip() {
        let pending = RebootPending {
            target_slot: Slot::B,
            image_ref: "ghcr.io/test/bootc:v2".into(),
            image_digest: sample_digest(),
            update_time: Utc::now(),
        };
        let json = serde_json::to_string(&pending).unwrap();
        let parsed: RebootPending = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pending);
    }
}
