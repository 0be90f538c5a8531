//! systemd-boot backend: BLS entry files under `loader/entries/`, the
//! default in `loader.conf`, one-shot boots via the `LoaderEntryOneShot`
//! EFI variable (`bootctl set-oneshot`).

use std::path::Path;

use indoc::formatdoc;
use log::info;

use nbc_api::config::Slot;
use nbc_api::error::{IoFailedError, NbcResult, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;

use super::{cmdline, entry_id, BootEntrySet, Bootloader};

pub struct SystemdBootloader<'a> {
    adapter: &'a dyn OsAdapter,
}

impl<'a> SystemdBootloader<'a> {
    pub fn new(adapter: &'a dyn OsAdapter) -> Self {
        SystemdBootloader { adapter }
    }

    fn entry_file(slot: Slot) -> String {
        format!("{}.conf", entry_id(slot))
    }
}

impl Bootloader for SystemdBootloader<'_> {
    fn install(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()> {
        info!("Installing systemd-boot to '{}'", esp_mount.display());
        self.adapter
            .run_checked(
                Dependency::Bootctl,
                &cmd_args!["install", "--esp-path", esp_mount],
            )
            .structured(IoFailedError::WriteBootEntries)?;
        self.write_entries(esp_mount, entries)?;
        self.set_default(esp_mount, entries.default_slot)
    }

    fn write_entries(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()> {
        for entry in &entries.entries {
            let options = cmdline::compose(&entry.root, &entries.luks_volumes, &entries.extra_args);
            let contents = formatdoc! {"
                title nbc (slot {slot})
                sort-key nbc
                linux {kernel}
                initrd {initrd}
                options {options}
                ",
                slot = entry.slot,
                kernel = entry.kernel_path,
                initrd = entry.initrd_path,
            };
            let path = esp_mount
                .join("loader/entries")
                .join(Self::entry_file(entry.slot));
            osutils::files::write_atomic(&path, contents, 0o644)
                .structured(IoFailedError::WriteBootEntries)?;
        }
        Ok(())
    }

    fn set_oneshot(&self, _esp_mount: &Path, slot: Slot) -> NbcResult<()> {
        self.adapter
            .run_checked(
                Dependency::Bootctl,
                &cmd_args!["set-oneshot", Self::entry_file(slot)],
            )
            .structured(IoFailedError::WriteBootEntries)
    }

    fn clear_oneshot(&self, _esp_mount: &Path) -> NbcResult<()> {
        self.adapter
            .run_checked(Dependency::Bootctl, &cmd_args!["set-oneshot", ""])
            .structured(IoFailedError::WriteBootEntries)
    }

    fn set_default(&self, esp_mount: &Path, slot: Slot) -> NbcResult<()> {
        let contents = formatdoc! {"
            default {entry}
            timeout 3
            ",
            entry = Self::entry_file(slot),
        };
        let path = esp_mount.join("loader/loader.conf");
        osutils::files::write_atomic(&path, contents, 0o644)
            .structured(IoFailedError::WriteBootEntries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{RootIdentity, SlotEntry};
    use osutils::testutils::RecordingAdapter;
    use uuid::Uuid;

    fn entry_set() -> BootEntrySet {
        BootEntrySet {
            entries: vec![
                SlotEntry {
                    slot: Slot::A,
                    root: RootIdentity::PartitionUuid(Uuid::from_u128(1)),
                    kernel_path: "/nbc/a/vmlinuz".into(),
                    initrd_path: "/nbc/a/initramfs.img".into(),
                },
                SlotEntry {
                    slot: Slot::B,
                    root: RootIdentity::PartitionUuid(Uuid::from_u128(2)),
                    kernel_path: "/nbc/b/vmlinuz".into(),
                    initrd_path: "/nbc/b/initramfs.img".into(),
                },
            ],
            default_slot: Slot::A,
            luks_volumes: vec![],
            extra_args: vec![],
        }
    }

    #[test]
    fn test_install_writes_entries_and_default() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = SystemdBootloader::new(&adapter);

        loader.install(esp.path(), &entry_set()).unwrap();

        assert!(adapter.invoked("bootctl install --esp-path"));

        let entry_a =
            std::fs::read_to_string(esp.path().join("loader/entries/nbc-a.conf")).unwrap();
        assert!(entry_a.contains("title nbc (slot A)"));
        assert!(entry_a.contains("linux /nbc/a/vmlinuz"));
        assert!(entry_a.contains("options root=UUID=00000000-0000-0000-0000-000000000001 rw"));
        assert!(esp.path().join("loader/entries/nbc-b.conf").exists());

        let loader_conf = std::fs::read_to_string(esp.path().join("loader/loader.conf")).unwrap();
        assert!(loader_conf.starts_with("default nbc-a.conf"));
    }

    #[test]
    fn test_oneshot_via_efi_variable() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = SystemdBootloader::new(&adapter);

        loader.set_oneshot(esp.path(), Slot::B).unwrap();
        assert!(adapter.invoked("bootctl set-oneshot nbc-b.conf"));

        loader.clear_oneshot(esp.path()).unwrap();
        let invocations = adapter.invocations();
        assert_eq!(invocations.last().unwrap(), "bootctl set-oneshot ");
    }

    #[test]
    fn test_set_default_rewrites_loader_conf() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = SystemdBootloader::new(&adapter);

        loader.set_default(esp.path(), Slot::B).unwrap();
        let loader_conf = std::fs::read_to_string(esp.path().join("loader/loader.conf")).unwrap();
        assert!(loader_conf.starts_with("default nbc-b.conf"));
    }
}
