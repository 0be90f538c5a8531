//! Formatting and the mounted-tree guard used by install and update.

use std::path::{Path, PathBuf};

use log::{info, warn};

use nbc_api::config::FilesystemType;
use nbc_api::error::{IoFailedError, NbcResult, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;

/// Everything mkfs can be asked to produce here. Root and var take
/// [`FilesystemType`]; the ESP is always FAT32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkfsFilesystem {
    Vfat,
    Ext4,
    Btrfs,
}

impl From<FilesystemType> for MkfsFilesystem {
    fn from(fs: FilesystemType) -> Self {
        match fs {
            FilesystemType::Ext4 => MkfsFilesystem::Ext4,
            FilesystemType::Btrfs => MkfsFilesystem::Btrfs,
        }
    }
}

impl MkfsFilesystem {
    pub fn name(self) -> &'static str {
        match self {
            MkfsFilesystem::Vfat => "vfat",
            MkfsFilesystem::Ext4 => "ext4",
            MkfsFilesystem::Btrfs => "btrfs",
        }
    }
}

/// Formats `device` with a force flag and the canonical label.
pub fn format(
    adapter: &dyn OsAdapter,
    device: &Path,
    filesystem: MkfsFilesystem,
    label: &str,
) -> NbcResult<()> {
    info!(
        "Formatting '{}' as {} (label '{label}')",
        device.display(),
        filesystem.name()
    );
    let args = match filesystem {
        MkfsFilesystem::Vfat => cmd_args!["--type", "vfat", "-F", "32", "-n", label, device],
        MkfsFilesystem::Ext4 => cmd_args!["--type", "ext4", "-F", "-L", label, device],
        MkfsFilesystem::Btrfs => cmd_args!["--type", "btrfs", "-f", "-L", label, device],
    };
    adapter
        .run_checked(Dependency::Mkfs, &args)
        .structured(IoFailedError::Format {
            device: device.to_owned(),
        })
}

/// Clears stale filesystem signatures, used before re-formatting an update
/// target slot.
pub fn wipe(adapter: &dyn OsAdapter, device: &Path) -> NbcResult<()> {
    adapter
        .run_checked(Dependency::Wipefs, &cmd_args!["--all", device])
        .structured(IoFailedError::Format {
            device: device.to_owned(),
        })
}

/// A stack of mounts released in reverse order. `unmount_all` is the loud
/// path; the drop handler is the quiet one for teardown on error.
pub struct MountStack<'a> {
    adapter: &'a dyn OsAdapter,
    root: PathBuf,
    mounted: Vec<PathBuf>,
}

impl<'a> MountStack<'a> {
    /// Mounts the full install tree: root at `mount_root`, the ESP at
    /// `<root>/boot`, var at `<root>/var`.
    pub fn mount_install_tree(
        adapter: &'a dyn OsAdapter,
        scheme_devices: InstallTreeDevices<'_>,
        mount_root: &Path,
    ) -> NbcResult<Self> {
        let mut stack = Self::mount_root(adapter, scheme_devices.root, mount_root)?;
        stack.mount_at(scheme_devices.esp, &mount_root.join("boot"))?;
        stack.mount_at(scheme_devices.var, &mount_root.join("var"))?;
        Ok(stack)
    }

    /// Mounts only a root partition, the shape the update path needs.
    pub fn mount_root(
        adapter: &'a dyn OsAdapter,
        device: &Path,
        mount_root: &Path,
    ) -> NbcResult<Self> {
        let mut stack = MountStack {
            adapter,
            root: mount_root.to_owned(),
            mounted: Vec::new(),
        };
        stack.mount_at(device, mount_root)?;
        Ok(stack)
    }

    fn mount_at(&mut self, device: &Path, target: &Path) -> NbcResult<()> {
        osutils::files::ensure_dir(target).structured(IoFailedError::Mount {
            device: device.to_owned(),
            target: target.to_owned(),
        })?;
        self.adapter
            .run_checked(Dependency::Mount, &cmd_args![device, target])
            .structured(IoFailedError::Mount {
                device: device.to_owned(),
                target: target.to_owned(),
            })?;
        self.mounted.push(target.to_owned());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Unmounts everything, newest first, failing on the first error.
    pub fn unmount_all(mut self) -> NbcResult<()> {
        while let Some(target) = self.mounted.pop() {
            self.adapter
                .run_checked(Dependency::Umount, &cmd_args![&target])
                .structured(IoFailedError::Mount {
                    device: PathBuf::new(),
                    target: target.clone(),
                })?;
        }
        Ok(())
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = self
                .adapter
                .run_checked(Dependency::Umount, &cmd_args![&target])
            {
                warn!("Failed to unmount '{}' during teardown: {e:#}", target.display());
            }
        }
    }
}

/// The three devices an install tree mounts.
pub struct InstallTreeDevices<'a> {
    pub root: &'a Path,
    pub esp: &'a Path,
    pub var: &'a Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use osutils::testutils::RecordingAdapter;

    #[test]
    fn test_format_args() {
        let adapter = RecordingAdapter::new();
        format(&adapter, Path::new("/dev/sda1"), MkfsFilesystem::Vfat, "UEFI").unwrap();
        format(&adapter, Path::new("/dev/sda2"), MkfsFilesystem::Ext4, "root1").unwrap();
        format(&adapter, Path::new("/dev/sda4"), MkfsFilesystem::Btrfs, "var").unwrap();

        let invocations = adapter.invocations();
        assert_eq!(
            invocations[0],
            "mkfs --type vfat -F 32 -n UEFI /dev/sda1"
        );
        assert_eq!(invocations[1], "mkfs --type ext4 -F -L root1 /dev/sda2");
        assert_eq!(invocations[2], "mkfs --type btrfs -f -L var /dev/sda4");
    }

    #[test]
    fn test_mount_tree_order_and_reverse_unmount() {
        let adapter = RecordingAdapter::new();
        let tmp = tempfile::tempdir().unwrap();
        let mount_root = tmp.path().join("mnt");

        let stack = MountStack::mount_install_tree(
            &adapter,
            InstallTreeDevices {
                root: Path::new("/dev/sda2"),
                esp: Path::new("/dev/sda1"),
                var: Path::new("/dev/sda4"),
            },
            &mount_root,
        )
        .unwrap();
        stack.unmount_all().unwrap();

        let invocations = adapter.invocations();
        let mounts: Vec<_> = invocations
            .iter()
            .filter(|i| i.starts_with("mount"))
            .collect();
        let umounts: Vec<_> = invocations
            .iter()
            .filter(|i| i.starts_with("umount"))
            .collect();

        assert_eq!(mounts.len(), 3);
        assert!(mounts[0].contains("/dev/sda2"));
        assert!(mounts[1].contains("/dev/sda1"));
        assert!(mounts[2].contains("/dev/sda4"));
        // Reverse order: var, boot, root.
        assert!(umounts[0].contains("/var"));
        assert!(umounts[1].contains("/boot"));
        assert_eq!(umounts[2], &format!("umount {}", mount_root.display()));
    }

    #[test]
    fn test_drop_unmounts_best_effort() {
        let adapter = RecordingAdapter::new();
        let tmp = tempfile::tempdir().unwrap();
        {
            let _stack =
                MountStack::mount_root(&adapter, Path::new("/dev/sda3"), tmp.path()).unwrap();
        }
        assert!(adapter.invoked("umount"));
    }

    #[test]
    fn test_filesystem_type_mapping() {
        assert_eq!(MkfsFilesystem::from(FilesystemType::Ext4).name(), "ext4");
        assert_eq!(MkfsFilesystem::from(FilesystemType::Btrfs).name(), "btrfs");
    }
}
