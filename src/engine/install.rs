//! The clean-install workflow: blank disk in, bootable A/B system out.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use log::info;
use uuid::Uuid;

use nbc_api::config::{
    BootloaderType, EncryptionConfig, FilesystemType, InstalledImage, Slot, SystemConfig,
};
use nbc_api::constants::{
    ESP_LABEL, IMAGE_MARKER_NAME, ROOT1_LABEL, ROOT2_LABEL, SYSTEM_LOCK_PATH, VAR_LABEL,
};
use nbc_api::error::{
    IoFailedError, LockHeldError, NbcError, NbcResult, PreconditionFailedError, ReportError,
};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;
use osutils::lock::{FileLock, LockError, LockMode};
use osutils::path::join_relative;

use crate::bootloader::{self, BootEntrySet, RootIdentity, SlotEntry};
use crate::cache::{CachedImage, ImageCache};
use crate::datastore::ConfigStore;
use crate::engine::{CancelToken, Workflow};
use crate::etcoverlay::{self, dracut};
use crate::extract;
use crate::report::Reporter;
use crate::storage::encryption::{KeyFile, LuksManager, LuksVolume};
use crate::storage::filesystems::{self, InstallTreeDevices, MkfsFilesystem, MountStack};
use crate::storage::partitioning::{self, PartitionScheme};

#[derive(Debug, Clone)]
pub struct EncryptionRequest {
    pub passphrase: String,
    pub tpm2: bool,
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub image_ref: String,
    pub device: PathBuf,
    pub filesystem: FilesystemType,
    pub bootloader: BootloaderType,
    pub kernel_args: Vec<String>,
    pub encryption: Option<EncryptionRequest>,
    /// Install from the pre-staged cache instead of the network.
    pub use_staged: bool,
    /// Where the target tree is assembled.
    pub mount_root: PathBuf,
}

impl InstallOptions {
    pub fn new(image_ref: impl Into<String>, device: impl Into<PathBuf>) -> Self {
        InstallOptions {
            image_ref: image_ref.into(),
            device: device.into(),
            filesystem: FilesystemType::default(),
            bootloader: BootloaderType::default(),
            kernel_args: Vec::new(),
            encryption: None,
            use_staged: false,
            mount_root: PathBuf::from("/run/nbc/install-root"),
        }
    }
}

struct InstallState<'a> {
    image: Option<CachedImage>,
    cache: ImageCache,
    scheme: Option<PartitionScheme>,
    luks: Vec<LuksVolume>,
    mounts: Option<MountStack<'a>>,
}

/// Runs the full install under the exclusive system lock.
pub fn install(
    adapter: &dyn OsAdapter,
    reporter: &dyn Reporter,
    token: CancelToken,
    options: &InstallOptions,
) -> NbcResult<()> {
    let _lock = acquire_system_lock()?;

    let mut state = InstallState {
        image: None,
        cache: if options.use_staged {
            ImageCache::staged_install()
        } else {
            ImageCache::system()
        },
        scheme: None,
        luks: Vec::new(),
        mounts: None,
    };

    let result = build_workflow(adapter, reporter, token, options).run(&mut state);
    teardown(adapter, &mut state);

    match result {
        Ok(()) => {
            reporter.complete(
                &format!(
                    "Installed '{}' to '{}'",
                    options.image_ref,
                    options.device.display()
                ),
                None,
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn build_workflow<'a>(
    adapter: &'a dyn OsAdapter,
    reporter: &'a dyn Reporter,
    token: CancelToken,
    options: &'a InstallOptions,
) -> Workflow<'a, InstallState<'a>> {
    Workflow::new(reporter, token)
        .step("Check preconditions", move |_state: &mut InstallState| {
            check_preconditions(adapter, options)
        })
        .step("Fetch image", move |state: &mut InstallState| {
            let image = if options.use_staged {
                state.cache.get_single()?
            } else {
                state.cache.download(&options.image_ref)?
            };
            info!(
                "Installing {} ({})",
                image.image_ref,
                image.image_digest.short()
            );
            state.image = Some(image);
            Ok(())
        })
        .step("Create partitions", move |state: &mut InstallState| {
            state.scheme = Some(partitioning::create_partitions(adapter, &options.device)?);
            Ok(())
        })
        .step("Set up encryption", move |state: &mut InstallState| {
            let Some(request) = &options.encryption else {
                return Ok(());
            };
            let scheme = state.scheme.as_ref().expect("partitions created");
            let key = KeyFile::new(&request.passphrase)?;
            let manager = LuksManager::new(adapter);

            for (device, mapper) in [
                (&scheme.root1, ROOT1_LABEL),
                (&scheme.root2, ROOT2_LABEL),
                (&scheme.var, VAR_LABEL),
            ] {
                manager.format(device, &key)?;
                let volume = manager.open(device, mapper, &key)?;
                if request.tpm2 {
                    manager.enroll_tpm2(device, &key)?;
                }
                state.luks.push(volume);
            }
            Ok(())
        })
        .step("Format filesystems", move |state: &mut InstallState| {
            let scheme = state.scheme.as_ref().expect("partitions created");
            filesystems::format(adapter, &scheme.esp, MkfsFilesystem::Vfat, ESP_LABEL)?;

            let fs = MkfsFilesystem::from(options.filesystem);
            for (label, plain) in [
                (ROOT1_LABEL, &scheme.root1),
                (ROOT2_LABEL, &scheme.root2),
                (VAR_LABEL, &scheme.var),
            ] {
                let device = data_device(&state.luks, label, plain);
                filesystems::format(adapter, &device, fs, label)?;
            }
            Ok(())
        })
        .step("Mount filesystems", move |state: &mut InstallState| {
            let scheme = state.scheme.as_ref().expect("partitions created");
            let root = data_device(&state.luks, ROOT1_LABEL, &scheme.root1);
            let var = data_device(&state.luks, VAR_LABEL, &scheme.var);
            state.mounts = Some(MountStack::mount_install_tree(
                adapter,
                InstallTreeDevices {
                    root: &root,
                    esp: &scheme.esp,
                    var: &var,
                },
                &options.mount_root,
            )?);
            Ok(())
        })
        .step("Extract image", move |state: &mut InstallState| {
            let image = state.image.as_ref().expect("image fetched");
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();

            let layers = state.cache.layers(&image.image_digest)?;
            extract::extract_layers(&layers, &target)?;
            extract::verify_extraction(&target)?;
            write_image_marker(&target, image)
        })
        .step("Configure /etc overlay", move |state: &mut InstallState| {
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();

            etcoverlay::populate_etc_lower(&target)?;
            etcoverlay::snapshot_pristine(&target, &target)?;
            etcoverlay::reserve_overlay_dirs(&target)?;
            etcoverlay::write_machine_id(&target)?;
            etcoverlay::install_tmpfiles(&target)?;
            dracut::install_module(&target)?;

            if let Some(request) = &options.encryption {
                crate::storage::encryption::write_crypttab(&target, &state.luks, request.tpm2)?;
            }
            Ok(())
        })
        .step("Regenerate initramfs", move |state: &mut InstallState| {
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();
            let kernel = dracut::find_kernel(&target)?;
            dracut::regenerate_initramfs(adapter, &target, &kernel)?;
            bootloader::kernel::stage_kernel(&target.join("boot"), Slot::A, &kernel)?;
            // Slot B receives the same artifacts; both entries must boot.
            bootloader::kernel::stage_kernel(&target.join("boot"), Slot::B, &kernel)?;
            Ok(())
        })
        .step("Install bootloader", move |state: &mut InstallState| {
            let scheme = state.scheme.as_ref().expect("partitions created");
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();

            let entries = build_entry_set(
                adapter,
                scheme,
                &state.luks,
                Slot::A,
                &options.kernel_args,
            )?;
            let loader = bootloader::for_type(options.bootloader, adapter);
            loader.install(&target.join("boot"), &entries)
        })
        .step("Write system configuration", move |state: &mut InstallState| {
            let image = state.image.as_ref().expect("image fetched");
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();

            let config = SystemConfig {
                image_ref: image.image_ref.clone(),
                image_digest: image.image_digest.clone(),
                device: options.device.clone(),
                disk_id: crate::bootdev::disk_id_of(&options.device),
                install_date: Utc::now(),
                kernel_args: options.kernel_args.clone(),
                bootloader: options.bootloader,
                filesystem: options.filesystem,
                encryption: options.encryption.as_ref().map(|request| EncryptionConfig {
                    tpm2: request.tpm2,
                    volumes: state.luks.iter().map(LuksVolume::record).collect(),
                }),
            };
            let store = ConfigStore::at(
                join_relative(&target, nbc_api::constants::CONFIG_PATH),
                vec![],
            );
            store.save(&config)
        })
}

fn check_preconditions(adapter: &dyn OsAdapter, options: &InstallOptions) -> NbcResult<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(NbcError::new(
            PreconditionFailedError::MissingRequiredPermissions,
        ));
    }

    let metadata = std::fs::metadata(&options.device)
        .with_context(|| format!("Failed to stat '{}'", options.device.display()))
        .structured(PreconditionFailedError::NotBlockDevice {
            path: options.device.clone(),
        })?;
    if !metadata.file_type().is_block_device() {
        return Err(NbcError::new(PreconditionFailedError::NotBlockDevice {
            path: options.device.clone(),
        }));
    }

    let mut tools = vec![
        Dependency::Sgdisk,
        Dependency::Partprobe,
        Dependency::Udevadm,
        Dependency::Mkfs,
        Dependency::Mount,
        Dependency::Umount,
        Dependency::Blkid,
        Dependency::Lsblk,
        Dependency::Chroot,
    ];
    if options.encryption.is_some() {
        tools.push(Dependency::Cryptsetup);
        tools.push(Dependency::SystemdCryptenroll);
    }
    match options.bootloader {
        BootloaderType::Grub2 => tools.push(Dependency::Grub2Install),
        BootloaderType::SystemdBoot => tools.push(Dependency::Bootctl),
    }
    for tool in tools {
        adapter
            .check_available(tool)
            .structured(PreconditionFailedError::MissingBinary {
                binary: tool.name().to_owned(),
            })?;
    }
    Ok(())
}

/// The device carrying data for a partition role: the mapper when
/// encrypted, the partition itself otherwise.
fn data_device(luks: &[LuksVolume], mapper: &str, plain: &Path) -> PathBuf {
    luks.iter()
        .find(|v| v.mapper == mapper)
        .map(LuksVolume::mapper_path)
        .unwrap_or_else(|| plain.to_owned())
}

/// Builds the A/B entry set over the slot directories kernels are staged
/// into. Root identity is the mapper name when encrypted, the partition
/// UUID otherwise.
pub(crate) fn build_entry_set(
    adapter: &dyn OsAdapter,
    scheme: &PartitionScheme,
    luks: &[LuksVolume],
    default_slot: Slot,
    extra_args: &[String],
) -> NbcResult<BootEntrySet> {
    let mut entries = Vec::new();
    for slot in [Slot::A, Slot::B] {
        let root = if luks.iter().any(|v| v.mapper == slot.root_label()) {
            RootIdentity::Mapper(slot.root_label().to_owned())
        } else {
            RootIdentity::PartitionUuid(partition_uuid(adapter, scheme.root_for(slot))?)
        };
        entries.push(SlotEntry {
            slot,
            root,
            kernel_path: format!("/{}/vmlinuz", bootloader::slot_dir(slot)),
            initrd_path: format!("/{}/initramfs.img", bootloader::slot_dir(slot)),
        });
    }

    Ok(BootEntrySet {
        entries,
        default_slot,
        luks_volumes: luks.iter().map(LuksVolume::record).collect(),
        extra_args: extra_args.to_vec(),
    })
}

fn partition_uuid(adapter: &dyn OsAdapter, device: &Path) -> NbcResult<Uuid> {
    let output = adapter
        .run_output(
            Dependency::Blkid,
            &cmd_args!["-o", "value", "-s", "UUID", device],
        )
        .structured(IoFailedError::Read {
            path: device.to_owned(),
        })?;
    Uuid::parse_str(output.trim())
        .with_context(|| format!("blkid returned an unusable UUID '{}'", output.trim()))
        .structured(IoFailedError::Read {
            path: device.to_owned(),
        })
}

/// Records which image a root carries, for boot confirmation and rollback.
pub(crate) fn write_image_marker(target: &Path, image: &CachedImage) -> NbcResult<()> {
    let marker = InstalledImage {
        image_ref: image.image_ref.clone(),
        image_digest: image.image_digest.clone(),
    };
    let path = target.join(IMAGE_MARKER_NAME);
    let contents = serde_json::to_string_pretty(&marker)
        .context("Failed to serialize image marker")
        .structured(IoFailedError::WriteFile { path: path.clone() })?;
    osutils::files::write_atomic(&path, contents, 0o644)
        .structured(IoFailedError::WriteFile { path })
}

pub(crate) fn acquire_system_lock() -> NbcResult<FileLock> {
    FileLock::acquire(SYSTEM_LOCK_PATH, LockMode::Exclusive).map_err(|e| match e {
        LockError::Held(path) => NbcError::new(LockHeldError::System { path }),
        LockError::Other(e) => NbcError::with_source(
            IoFailedError::WriteFile {
                path: PathBuf::from(SYSTEM_LOCK_PATH),
            },
            e,
        ),
    })
}

fn teardown(adapter: &dyn OsAdapter, state: &mut InstallState) {
    if let Some(mounts) = state.mounts.take() {
        drop(mounts);
    }
    let manager = LuksManager::new(adapter);
    for volume in state.luks.drain(..).rev() {
        manager.close_best_effort(&volume.mapper);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osutils::testutils::RecordingAdapter;

    #[test]
    fn test_data_device_prefers_mapper() {
        let luks = vec![LuksVolume {
            device: PathBuf::from("/dev/sda2"),
            mapper: "root1".into(),
            uuid: Uuid::from_u128(1),
        }];
        assert_eq!(
            data_device(&luks, "root1", Path::new("/dev/sda2")),
            Path::new("/dev/mapper/root1")
        );
        assert_eq!(
            data_device(&luks, "var", Path::new("/dev/sda4")),
            Path::new("/dev/sda4")
        );
    }

    #[test]
    fn test_build_entry_set_plain() {
        let adapter = RecordingAdapter::new();
        adapter.push_output(Dependency::Blkid, "11111111-1111-1111-1111-111111111111\n");
        adapter.push_output(Dependency::Blkid, "22222222-2222-2222-2222-222222222222\n");

        let scheme = PartitionScheme::for_disk("/dev/sda").unwrap();
        let set = build_entry_set(&adapter, &scheme, &[], Slot::A, &[]).unwrap();

        assert_eq!(set.entries.len(), 2);
        assert_eq!(
            set.entries[0].root,
            RootIdentity::PartitionUuid(
                Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()
            )
        );
        assert_eq!(set.entries[1].kernel_path, "/nbc/b/vmlinuz");
        assert!(adapter.invoked("blkid -o value -s UUID /dev/sda2"));
        assert!(adapter.invoked("blkid -o value -s UUID /dev/sda3"));
    }

    #[test]
    fn test_build_entry_set_encrypted_uses_mappers() {
        let adapter = RecordingAdapter::new();
        let scheme = PartitionScheme::for_disk("/dev/sda").unwrap();
        let luks = vec![
            LuksVolume {
                device: scheme.root1.clone(),
                mapper: "root1".into(),
                uuid: Uuid::from_u128(0xa),
            },
            LuksVolume {
                device: scheme.root2.clone(),
                mapper: "root2".into(),
                uuid: Uuid::from_u128(0xb),
            },
        ];
        let set = build_entry_set(&adapter, &scheme, &luks, Slot::A, &[]).unwrap();

        assert_eq!(set.entries[0].root, RootIdentity::Mapper("root1".into()));
        assert_eq!(set.entries[1].root, RootIdentity::Mapper("root2".into()));
        // No blkid needed when every root is a mapper.
        assert!(adapter.invocations().is_empty());
        assert_eq!(set.luks_volumes.len(), 2);
    }

    #[test]
    fn test_write_image_marker() {
        let target = tempfile::tempdir().unwrap();
        let image = CachedImage {
            image_ref: "ghcr.io/test/bootc:v1".into(),
            image_digest: nbc_api::digest::Digest::parse(&format!("sha256:{}", "aa".repeat(32)))
                .unwrap(),
            download_date: Utc::now(),
            architecture: "amd64".into(),
            labels: Default::default(),
            os_release_pretty_name: None,
            os_release_version_id: None,
            os_release_id: None,
            size_bytes: 1,
        };
        write_image_marker(target.path(), &image).unwrap();

        let marker: InstalledImage = serde_json::from_str(
            &std::fs::read_to_string(target.path().join(".nbc-image.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(marker.image_digest, image.image_digest);
    }
}
