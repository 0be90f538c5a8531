//! The A/B update state machine.
//!
//! Check → select inactive slot → fetch/extract → merge /etc → boot
//! entries (one-shot to the new slot, default kept on the old) → commit.
//! `SystemConfig` records the next-boot image at commit; `boot-confirm`
//! promotes the default after the new slot actually booted.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use log::{info, warn};

use nbc_api::config::{RebootPending, Slot, SystemConfig};
use nbc_api::constants::{BOOTED_MARKER_PATH, REBOOT_REQUIRED_PATH};
use nbc_api::error::{
    IoFailedError, NbcError, NbcResult, PreconditionFailedError, ReportError,
};
use osutils::adapter::OsAdapter;
use osutils::path::join_relative;

use crate::bootloader;
use crate::bootdev;
use crate::cache::{CachedImage, ImageCache};
use crate::datastore::ConfigStore;
use crate::engine::{install, CancelToken, Workflow};
use crate::etcoverlay::{self, dracut};
use crate::extract;
use crate::report::Reporter;
use crate::storage::encryption::LuksVolume;
use crate::storage::filesystems::{self, MkfsFilesystem, MountStack};
use crate::storage::partitioning::{self, PartitionScheme};

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Reference to update to; defaults to the installed one.
    pub image_ref: Option<String>,
    /// Use the pre-staged update cache instead of the network.
    pub use_staged: bool,
    /// Where the target slot is mounted during extraction.
    pub mount_root: PathBuf,
    /// Root of the running system; only tests point this elsewhere.
    pub system_root: PathBuf,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            image_ref: None,
            use_staged: false,
            mount_root: PathBuf::from("/run/nbc/update-root"),
            system_root: PathBuf::from("/"),
        }
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    /// The installed digest already matches; nothing staged.
    UpToDate,
    /// The inactive slot carries the new image; reboot to activate.
    Staged(RebootPending),
}

struct UpdateState<'a> {
    config: SystemConfig,
    image_ref: String,
    scheme: Option<PartitionScheme>,
    active_slot: Option<Slot>,
    target_slot: Option<Slot>,
    cache: ImageCache,
    image: Option<CachedImage>,
    mounts: Option<MountStack<'a>>,
    pending: Option<RebootPending>,
}

/// Stages an update onto the inactive slot, under the exclusive system lock.
pub fn update(
    adapter: &dyn OsAdapter,
    reporter: &dyn Reporter,
    token: CancelToken,
    options: &UpdateOptions,
) -> NbcResult<UpdateOutcome> {
    let _lock = install::acquire_system_lock()?;

    let config = ConfigStore::system().load()?;
    check_preconditions(options)?;

    let image_ref = options
        .image_ref
        .clone()
        .unwrap_or_else(|| config.image_ref.clone());

    // Check: resolve the new digest and terminate early when nothing
    // changed. The staged cache already knows its digest; the network path
    // asks the registry.
    let cache = if options.use_staged {
        ImageCache::staged_update()
    } else {
        ImageCache::system()
    };
    let new_digest = if options.use_staged {
        cache.get_single()?.image_digest
    } else {
        crate::cache::resolve_digest(&image_ref).structured(IoFailedError::Download {
            reference: image_ref.clone(),
        })?
    };
    if new_digest == config.image_digest {
        info!("Already running {}", new_digest.short());
        reporter.complete("System is up to date", None);
        return Ok(UpdateOutcome::UpToDate);
    }

    let mut state = UpdateState {
        config,
        image_ref,
        scheme: None,
        active_slot: None,
        target_slot: None,
        cache,
        image: None,
        mounts: None,
        pending: None,
    };

    let result = build_workflow(adapter, reporter, token, options).run(&mut state);
    if let Some(mounts) = state.mounts.take() {
        drop(mounts);
    }

    match result {
        Ok(()) => {
            let pending = state.pending.take().expect("commit ran");
            reporter.complete(
                &format!(
                    "Update to {} staged on slot {}; reboot to activate",
                    pending.image_digest.short(),
                    pending.target_slot
                ),
                Some(serde_json::to_value(&pending).unwrap_or_default()),
            );
            Ok(UpdateOutcome::Staged(pending))
        }
        Err(e) => Err(e),
    }
}

fn check_preconditions(options: &UpdateOptions) -> NbcResult<()> {
    let booted_marker = join_relative(&options.system_root, BOOTED_MARKER_PATH);
    if !booted_marker.exists() {
        return Err(NbcError::new(PreconditionFailedError::NotManagedSystem {
            marker: booted_marker,
        }));
    }
    let reboot_marker = join_relative(&options.system_root, REBOOT_REQUIRED_PATH);
    if reboot_marker.exists() {
        return Err(NbcError::new(PreconditionFailedError::UpdatePendingReboot));
    }
    Ok(())
}

fn build_workflow<'a>(
    adapter: &'a dyn OsAdapter,
    reporter: &'a dyn Reporter,
    token: CancelToken,
    options: &'a UpdateOptions,
) -> Workflow<'a, UpdateState<'a>> {
    Workflow::new(reporter, token)
        .step("Select target slot", move |state: &mut UpdateState| {
            let boot = bootdev::detect_boot_device(adapter)?;
            bootdev::verify_disk_id(&boot.disk, state.config.disk_id.as_deref());
            if boot.disk != state.config.device {
                warn!(
                    "Booted from '{}' but configuration records '{}'",
                    boot.disk.display(),
                    state.config.device.display()
                );
            }

            let scheme = partitioning::detect_existing_scheme(&boot.disk)?;
            let active = bootdev::active_slot(&boot, &scheme)?;
            let target = active.other();
            info!("Active slot {active}, staging update to slot {target}");

            state.scheme = Some(scheme);
            state.active_slot = Some(active);
            state.target_slot = Some(target);
            Ok(())
        })
        .step("Fetch image", move |state: &mut UpdateState| {
            let image = if options.use_staged {
                state.cache.get_single()?
            } else {
                let image_ref = state.image_ref.clone();
                state.cache.download(&image_ref)?
            };
            state.image = Some(image);
            Ok(())
        })
        .step("Prepare target slot", move |state: &mut UpdateState| {
            let device = state.target_device();
            // Re-formatting wipes whatever a cancelled earlier attempt left.
            filesystems::wipe(adapter, &device)?;
            filesystems::format(
                adapter,
                &device,
                MkfsFilesystem::from(state.config.filesystem),
                state.target_slot.expect("slot selected").root_label(),
            )
        })
        .step("Extract image", move |state: &mut UpdateState| {
            let device = state.target_device();
            let mounts = MountStack::mount_root(adapter, &device, &options.mount_root)?;
            let target = mounts.path().to_owned();
            state.mounts = Some(mounts);

            let image = state.image.as_ref().expect("image fetched");
            let layers = state.cache.layers(&image.image_digest)?;
            extract::extract_layers(&layers, &target)?;
            extract::verify_extraction(&target)?;
            install::write_image_marker(&target, image)
        })
        .step("Merge /etc", move |state: &mut UpdateState| {
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();
            let system_root = &options.system_root;

            etcoverlay::populate_etc_lower(&target)?;
            etcoverlay::reserve_overlay_dirs(system_root)?;
            etcoverlay::write_machine_id(&target)?;
            etcoverlay::install_tmpfiles(&target)?;
            dracut::install_module(&target)?;

            let conflicts = etcoverlay::detect_conflicts(
                &join_relative(system_root, nbc_api::constants::ETC_OVERLAY_UPPER),
                &join_relative(system_root, nbc_api::constants::ETC_PRISTINE_DIR),
                &target.join("etc"),
            )?;
            for conflict in &conflicts {
                reporter.warning(&format!(
                    "/etc/{} was changed both locally and by the new image; keeping the local version",
                    conflict.path.display()
                ));
            }
            etcoverlay::snapshot_pristine(&target, system_root)?;

            if let Some(encryption) = &state.config.encryption {
                crate::storage::encryption::write_crypttab(
                    &target,
                    &luks_volumes(&state.config),
                    encryption.tpm2,
                )?;
            }
            Ok(())
        })
        .step("Regenerate initramfs", move |state: &mut UpdateState| {
            let target = state.mounts.as_ref().expect("mounted").path().to_owned();
            let kernel = dracut::find_kernel(&target)?;
            dracut::regenerate_initramfs(adapter, &target, &kernel)?;

            let esp_mount = join_relative(&options.system_root, "/boot");
            bootloader::kernel::stage_kernel(
                &esp_mount,
                state.target_slot.expect("slot selected"),
                &kernel,
            )?;
            Ok(())
        })
        .step("Write boot entries", move |state: &mut UpdateState| {
            let scheme = state.scheme.as_ref().expect("scheme detected");
            let active = state.active_slot.expect("slot selected");
            let target = state.target_slot.expect("slot selected");
            let esp_mount = join_relative(&options.system_root, "/boot");

            let luks = luks_volumes(&state.config);

            // Default stays on the active slot; only the one-shot entry
            // points at the new one, so a failed boot falls back.
            let entries = install::build_entry_set(
                adapter,
                scheme,
                &luks,
                active,
                &state.config.kernel_args,
            )?;
            let loader = bootloader::for_type(state.config.bootloader, adapter);
            loader.write_entries(&esp_mount, &entries)?;
            loader.set_default(&esp_mount, active)?;
            loader.set_oneshot(&esp_mount, target)
        })
        .step("Commit", move |state: &mut UpdateState| {
            let image = state.image.as_ref().expect("image fetched");
            let target = state.target_slot.expect("slot selected");

            let mut config = state.config.clone();
            config.image_ref = image.image_ref.clone();
            config.image_digest = image.image_digest.clone();
            ConfigStore::system().save(&config)?;
            state.config = config;

            let pending = RebootPending {
                target_slot: target,
                image_ref: image.image_ref.clone(),
                image_digest: image.image_digest.clone(),
                update_time: Utc::now(),
            };
            write_reboot_marker(&options.system_root, &pending)?;
            state.pending = Some(pending);
            Ok(())
        })
        .step("Unmount target", move |state: &mut UpdateState| {
            if let Some(mounts) = state.mounts.take() {
                mounts.unmount_all()?;
            }
            Ok(())
        })
}

/// Rehydrates LUKS volumes from the configuration record. The backing
/// device is not needed for crypttab or boot entries, only mapper + UUID.
fn luks_volumes(config: &SystemConfig) -> Vec<LuksVolume> {
    config
        .encryption
        .iter()
        .flat_map(|e| e.volumes.iter())
        .map(|record| LuksVolume {
            device: PathBuf::new(),
            mapper: record.mapper.clone(),
            uuid: record.luks_uuid,
        })
        .collect()
}

impl UpdateState<'_> {
    /// The device the target slot's filesystem lives on: the stable mapper
    /// when encrypted (crypttab keeps both slots open), the partition
    /// otherwise.
    fn target_device(&self) -> PathBuf {
        let scheme = self.scheme.as_ref().expect("scheme detected");
        let target = self.target_slot.expect("slot selected");
        if self.config.encryption.is_some() {
            PathBuf::from(format!("/dev/mapper/{}", target.root_label()))
        } else {
            scheme.root_for(target).to_owned()
        }
    }
}

/// Writes `/run/nbc-reboot-required`. Lives on tmpfs; a reboot clears it.
pub fn write_reboot_marker(system_root: &Path, pending: &RebootPending) -> NbcResult<()> {
    let path = join_relative(system_root, REBOOT_REQUIRED_PATH);
    let contents = serde_json::to_string_pretty(pending)
        .context("Failed to serialize reboot marker")
        .structured(IoFailedError::WriteFile { path: path.clone() })?;
    osutils::files::write_atomic(&path, contents, 0o644)
        .structured(IoFailedError::WriteFile { path })
}

/// Reads the pending-update record, if any.
pub fn read_reboot_marker(system_root: &Path) -> NbcResult<Option<RebootPending>> {
    let path = join_relative(system_root, REBOOT_REQUIRED_PATH);
    if !path.is_file() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read '{}'", path.display()))
        .structured(IoFailedError::Read { path: path.clone() })?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse '{}'", path.display()))
        .structured(IoFailedError::Read { path })
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbc_api::digest::Digest;

    #[test]
    fn test_reboot_marker_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        assert!(read_reboot_marker(root.path()).unwrap().is_none());

        let pending = RebootPending {
            target_slot: Slot::B,
            image_ref: "ghcr.io/test/bootc:v2".into(),
            image_digest: Digest::parse(&format!("sha256:{}", "bb".repeat(32))).unwrap(),
            update_time: Utc::now(),
        };
        write_reboot_marker(root.path(), &pending).unwrap();
        assert_eq!(read_reboot_marker(root.path()).unwrap(), Some(pending));
    }

    #[test]
    fn test_preconditions_require_managed_system() {
        let root = tempfile::tempdir().unwrap();
        let options = UpdateOptions {
            system_root: root.path().to_owned(),
            ..Default::default()
        };

        let err = check_preconditions(&options).unwrap_err();
        assert!(matches!(
            err.kind(),
            nbc_api::error::ErrorKind::PreconditionFailed(
                PreconditionFailedError::NotManagedSystem { .. }
            )
        ));

        // Marker present: preconditions pass.
        std::fs::create_dir_all(root.path().join("run")).unwrap();
        std::fs::write(root.path().join("run/nbc-booted"), "nbc").unwrap();
        check_preconditions(&options).unwrap();

        // A pending reboot blocks a second staging.
        std::fs::write(root.path().join("run/nbc-reboot-required"), "{}").unwrap();
        let err = check_preconditions(&options).unwrap_err();
        assert!(matches!(
            err.kind(),
            nbc_api::error::ErrorKind::PreconditionFailed(
                PreconditionFailedError::UpdatePendingReboot
            )
        ));
    }
}
