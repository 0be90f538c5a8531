//! Staging of a slot's kernel and initramfs onto the ESP, where both
//! backends load them from.

use std::fs;
use std::path::Path;

use anyhow::Context;
use log::info;

use nbc_api::config::Slot;
use nbc_api::error::{IoFailedError, NbcResult, ReportError};

use super::slot_dir;
use crate::etcoverlay::dracut::KernelImage;

/// ESP-relative paths of a staged kernel, as referenced by boot entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedKernel {
    pub kernel_path: String,
    pub initrd_path: String,
}

/// Copies vmlinuz and the initramfs into `<esp>/nbc/<slot>/`, replacing
/// whatever the slot staged before.
pub fn stage_kernel(esp_mount: &Path, slot: Slot, kernel: &KernelImage) -> NbcResult<StagedKernel> {
    let dir = esp_mount.join(slot_dir(slot));
    osutils::files::ensure_dir(&dir).structured(IoFailedError::PopulateTree {
        path: dir.clone(),
    })?;

    let copy = |source: &Path, name: &str| -> NbcResult<()> {
        fs::copy(source, dir.join(name))
            .with_context(|| {
                format!(
                    "Failed to stage '{}' to '{}'",
                    source.display(),
                    dir.display()
                )
            })
            .structured(IoFailedError::PopulateTree { path: dir.clone() })?;
        Ok(())
    };
    copy(&kernel.vmlinuz, "vmlinuz")?;
    copy(&kernel.initramfs, "initramfs.img")?;

    info!(
        "Staged kernel {} for slot {slot} on the ESP",
        kernel.version
    );
    Ok(StagedKernel {
        kernel_path: format!("/{}/vmlinuz", slot_dir(slot)),
        initrd_path: format!("/{}/initramfs.img", slot_dir(slot)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kernel() {
        let root = tempfile::tempdir().unwrap();
        let esp = tempfile::tempdir().unwrap();

        let vmlinuz = root.path().join("usr/lib/modules/6.11.0/vmlinuz");
        let initramfs = root.path().join("boot/initramfs-6.11.0.img");
        fs::create_dir_all(vmlinuz.parent().unwrap()).unwrap();
        fs::create_dir_all(initramfs.parent().unwrap()).unwrap();
        fs::write(&vmlinuz, "kernel").unwrap();
        fs::write(&initramfs, "initrd").unwrap();

        let kernel = KernelImage {
            version: "6.11.0".into(),
            vmlinuz,
            initramfs,
        };
        let staged = stage_kernel(esp.path(), Slot::B, &kernel).unwrap();

        assert_eq!(staged.kernel_path, "/nbc/b/vmlinuz");
        assert_eq!(staged.initrd_path, "/nbc/b/initramfs.img");
        assert_eq!(
            fs::read_to_string(esp.path().join("nbc/b/vmlinuz")).unwrap(),
            "kernel"
        );
        assert_eq!(
            fs::read_to_string(esp.path().join("nbc/b/initramfs.img")).unwrap(),
            "initrd"
        );
    }
}
