//! GRUB2 backend: a generated `grub.cfg` with one menuentry per slot, the
//! default and one-shot selection stored in `grubenv` (`saved_entry` /
//! `next_entry`, the `grub2-reboot` mechanic).

use std::path::{Path, PathBuf};

use indoc::formatdoc;
use log::info;

use nbc_api::config::Slot;
use nbc_api::error::{IoFailedError, NbcResult, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;

use super::{cmdline, entry_id, BootEntrySet, Bootloader};

pub struct GrubBootloader<'a> {
    adapter: &'a dyn OsAdapter,
}

impl<'a> GrubBootloader<'a> {
    pub fn new(adapter: &'a dyn OsAdapter) -> Self {
        GrubBootloader { adapter }
    }

    fn grub_dir(esp_mount: &Path) -> PathBuf {
        esp_mount.join("grub2")
    }

    fn grubenv(esp_mount: &Path) -> PathBuf {
        Self::grub_dir(esp_mount).join("grubenv")
    }

    fn editenv(&self, esp_mount: &Path, args: &[&str]) -> NbcResult<()> {
        let mut full = vec![Self::grubenv(esp_mount).into_os_string()];
        full.extend(args.iter().map(|a| std::ffi::OsString::from(*a)));
        self.adapter
            .run_checked(Dependency::Grub2Editenv, &full)
            .structured(IoFailedError::WriteBootEntries)
    }
}

impl Bootloader for GrubBootloader<'_> {
    fn install(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()> {
        info!("Installing GRUB2 to '{}'", esp_mount.display());
        self.adapter
            .run_checked(
                Dependency::Grub2Install,
                &cmd_args![
                    "--target=x86_64-efi",
                    format!("--efi-directory={}", esp_mount.display()),
                    format!("--boot-directory={}", esp_mount.display()),
                    "--removable"
                ],
            )
            .structured(IoFailedError::WriteBootEntries)?;
        self.write_entries(esp_mount, entries)?;
        self.set_default(esp_mount, entries.default_slot)
    }

    fn write_entries(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()> {
        let mut menuentries = String::new();
        for entry in &entries.entries {
            let options = cmdline::compose(&entry.root, &entries.luks_volumes, &entries.extra_args);
            menuentries.push_str(&formatdoc! {"
                menuentry 'nbc (slot {slot})' --id {id} {{
                    linux {kernel} {options}
                    initrd {initrd}
                }}
                ",
                slot = entry.slot,
                id = entry_id(entry.slot),
                kernel = entry.kernel_path,
                initrd = entry.initrd_path,
            });
        }

        let config = formatdoc! {"
            set timeout=3
            load_env

            set default=\"${{saved_entry}}\"
            if [ \"${{next_entry}}\" ]; then
                set default=\"${{next_entry}}\"
                set next_entry=
                save_env next_entry
            fi

            {menuentries}"
        };

        let path = Self::grub_dir(esp_mount).join("grub.cfg");
        osutils::files::write_atomic(&path, config, 0o644)
            .structured(IoFailedError::WriteBootEntries)
    }

    fn set_oneshot(&self, esp_mount: &Path, slot: Slot) -> NbcResult<()> {
        self.editenv(
            esp_mount,
            &["set", &format!("next_entry={}", entry_id(slot))],
        )
    }

    fn clear_oneshot(&self, esp_mount: &Path) -> NbcResult<()> {
        self.editenv(esp_mount, &["unset", "next_entry"])
    }

    fn set_default(&self, esp_mount: &Path, slot: Slot) -> NbcResult<()> {
        self.editenv(
            esp_mount,
            &["set", &format!("saved_entry={}", entry_id(slot))],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{RootIdentity, SlotEntry};
    use nbc_api::config::LuksVolumeRecord;
    use osutils::testutils::RecordingAdapter;
    use uuid::Uuid;

    fn encrypted_entry_set() -> BootEntrySet {
        BootEntrySet {
            entries: vec![
                SlotEntry {
                    slot: Slot::A,
                    root: RootIdentity::Mapper("root1".into()),
                    kernel_path: "/nbc/a/vmlinuz".into(),
                    initrd_path: "/nbc/a/initramfs.img".into(),
                },
                SlotEntry {
                    slot: Slot::B,
                    root: RootIdentity::Mapper("root2".into()),
                    kernel_path: "/nbc/b/vmlinuz".into(),
                    initrd_path: "/nbc/b/initramfs.img".into(),
                },
            ],
            default_slot: Slot::A,
            luks_volumes: vec![LuksVolumeRecord {
                mapper: "root1".into(),
                luks_uuid: Uuid::from_u128(0xa),
            }],
            extra_args: vec![],
        }
    }

    #[test]
    fn test_grub_cfg_contents() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = GrubBootloader::new(&adapter);

        loader.write_entries(esp.path(), &encrypted_entry_set()).unwrap();

        let config = std::fs::read_to_string(esp.path().join("grub2/grub.cfg")).unwrap();
        assert!(config.contains("menuentry 'nbc (slot A)' --id nbc-a"));
        assert!(config.contains("menuentry 'nbc (slot B)' --id nbc-b"));
        assert!(config.contains("linux /nbc/a/vmlinuz root=/dev/mapper/root1"));
        assert!(config.contains("rd.luks.uuid=00000000-0000-0000-0000-00000000000a"));
        assert!(config.contains("set default=\"${saved_entry}\""));
        assert!(config.contains("save_env next_entry"));
    }

    #[test]
    fn test_install_runs_grub2_install() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = GrubBootloader::new(&adapter);

        loader.install(esp.path(), &encrypted_entry_set()).unwrap();
        assert!(adapter.invoked("grub2-install --target=x86_64-efi"));
        assert!(adapter.invoked("grub2-editenv"));
        assert!(adapter.invoked("set saved_entry=nbc-a"));
    }

    #[test]
    fn test_oneshot_env_handling() {
        let adapter = RecordingAdapter::new();
        let esp = tempfile::tempdir().unwrap();
        let loader = GrubBootloader::new(&adapter);

        loader.set_oneshot(esp.path(), Slot::B).unwrap();
        assert!(adapter.invoked("set next_entry=nbc-b"));

        loader.clear_oneshot(esp.path()).unwrap();
        assert!(adapter.invoked("unset next_entry"));
    }
}
