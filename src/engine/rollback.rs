//! Post-update reconciliation: manual rollback of a staged update, and the
//! boot confirmation that promotes a successfully booted slot to default.

use std::path::Path;

use anyhow::Context;
use log::{info, warn};

use nbc_api::config::InstalledImage;
use nbc_api::constants::{BOOTED_MARKER_PATH, IMAGE_MARKER_NAME, REBOOT_REQUIRED_PATH};
use nbc_api::error::{
    IoFailedError, NbcError, NbcResult, PreconditionFailedError, ReportError,
    VerificationFailedError,
};
use osutils::adapter::OsAdapter;
use osutils::path::join_relative;

use crate::bootdev;
use crate::bootloader;
use crate::datastore::ConfigStore;
use crate::engine::install::acquire_system_lock;
use crate::storage::partitioning;

/// Clears a staged-but-not-booted update: disarms the one-shot entry,
/// removes the reboot marker, and rewrites the configuration to the image
/// actually running.
pub fn rollback(adapter: &dyn OsAdapter, system_root: &Path) -> NbcResult<()> {
    let _lock = acquire_system_lock()?;

    let store = ConfigStore::system();
    let mut config = store.load()?;

    let esp_mount = join_relative(system_root, "/boot");
    let loader = bootloader::for_type(config.bootloader, adapter);
    loader.clear_oneshot(&esp_mount)?;

    let marker = join_relative(system_root, REBOOT_REQUIRED_PATH);
    if marker.is_file() {
        if let Err(e) = std::fs::remove_file(&marker) {
            warn!("Failed to remove '{}': {e}", marker.display());
        }
    }

    // The configuration was committed to the next-boot image; point it back
    // at what this slot actually carries.
    let running = read_image_marker(system_root)?;
    if config.image_digest != running.image_digest {
        info!(
            "Reverting recorded image from {} to {}",
            config.image_digest.short(),
            running.image_digest.short()
        );
        config.image_ref = running.image_ref;
        config.image_digest = running.image_digest;
        store.save(&config)?;
    }

    info!("Rolled back staged update");
    Ok(())
}

/// Boot confirmation, run after a successful boot (e.g. from a oneshot
/// service): when the running image matches the configuration, the active
/// slot becomes the stored bootloader default and one-shot state is
/// cleared.
pub fn boot_confirm(adapter: &dyn OsAdapter, system_root: &Path) -> NbcResult<()> {
    let booted_marker = join_relative(system_root, BOOTED_MARKER_PATH);
    if !booted_marker.exists() {
        return Err(NbcError::new(PreconditionFailedError::NotManagedSystem {
            marker: booted_marker,
        }));
    }

    let config = ConfigStore::system().load()?;
    let running = read_image_marker(system_root)?;
    if running.image_digest != config.image_digest {
        // We are not on the slot the update staged: the one-shot boot did
        // not stick. Rollback is the tool for that state.
        return Err(NbcError::new(VerificationFailedError::DigestMismatch {
            expected: config.image_digest.to_string(),
            actual: running.image_digest.to_string(),
        }));
    }

    let boot = bootdev::detect_boot_device(adapter)?;
    let scheme = partitioning::detect_existing_scheme(&boot.disk)?;
    let active = bootdev::active_slot(&boot, &scheme)?;

    let esp_mount = join_relative(system_root, "/boot");
    let loader = bootloader::for_type(config.bootloader, adapter);
    loader.set_default(&esp_mount, active)?;
    loader.clear_oneshot(&esp_mount)?;

    info!("Confirmed boot of slot {active} ({})", config.image_digest.short());
    Ok(())
}

fn read_image_marker(system_root: &Path) -> NbcResult<InstalledImage> {
    let path = system_root.join(IMAGE_MARKER_NAME);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read '{}'", path.display()))
        .structured(IoFailedError::Read { path: path.clone() })?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse '{}'", path.display()))
        .structured(IoFailedError::Read { path })
}
