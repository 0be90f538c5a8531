//! Boot entry management for both bootloader backends.
//!
//! The contract: given the partition scheme, the active slot, kernel args,
//! and LUKS volumes when encrypted, persist an A/B entry set that (a) boots
//! unattended into the active slot and (b) supports one transient
//! try-the-other-slot entry consumed at next boot.

pub mod cmdline;
pub mod grub;
pub mod kernel;
pub mod systemd_boot;

use std::path::Path;

use uuid::Uuid;

use nbc_api::config::{BootloaderType, LuksVolumeRecord, Slot};
use nbc_api::error::NbcResult;
use osutils::adapter::OsAdapter;

/// Boot-time identity of a root filesystem. Never a plain device name;
/// those are not stable across boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootIdentity {
    /// `root=UUID=<uuid>` for plaintext installs.
    PartitionUuid(Uuid),
    /// `root=/dev/mapper/<name>` for encrypted installs; crypttab resolves
    /// the mapper from the LUKS UUID at boot.
    Mapper(String),
}

/// One slot's bootable artifacts, with ESP-relative kernel paths.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub slot: Slot,
    pub root: RootIdentity,
    pub kernel_path: String,
    pub initrd_path: String,
}

/// Everything a backend needs to persist the entry set.
#[derive(Debug, Clone)]
pub struct BootEntrySet {
    pub entries: Vec<SlotEntry>,
    pub default_slot: Slot,
    pub luks_volumes: Vec<LuksVolumeRecord>,
    pub extra_args: Vec<String>,
}

impl BootEntrySet {
    pub fn entry_for(&self, slot: Slot) -> Option<&SlotEntry> {
        self.entries.iter().find(|e| e.slot == slot)
    }
}

pub trait Bootloader {
    /// Installs the bootloader onto the ESP and persists both entries, with
    /// the default pointing at `default_slot`.
    fn install(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()>;

    /// Rewrites the entry files without reinstalling the loader binary.
    fn write_entries(&self, esp_mount: &Path, entries: &BootEntrySet) -> NbcResult<()>;

    /// Arms a one-shot boot into `slot`; the stored default is untouched.
    fn set_oneshot(&self, esp_mount: &Path, slot: Slot) -> NbcResult<()>;

    /// Disarms any pending one-shot boot.
    fn clear_oneshot(&self, esp_mount: &Path) -> NbcResult<()>;

    /// Repoints the stored default at `slot`.
    fn set_default(&self, esp_mount: &Path, slot: Slot) -> NbcResult<()>;
}

/// Backend selection.
pub fn for_type<'a>(
    kind: BootloaderType,
    adapter: &'a dyn OsAdapter,
) -> Box<dyn Bootloader + 'a> {
    match kind {
        BootloaderType::Grub2 => Box::new(grub::GrubBootloader::new(adapter)),
        BootloaderType::SystemdBoot => Box::new(systemd_boot::SystemdBootloader::new(adapter)),
    }
}

/// Entry id used by both backends, `nbc-a` / `nbc-b`.
pub fn entry_id(slot: Slot) -> &'static str {
    match slot {
        Slot::A => "nbc-a",
        Slot::B => "nbc-b",
    }
}

/// ESP-relative directory a slot's kernel and initramfs are staged into.
pub fn slot_dir(slot: Slot) -> &'static str {
    match slot {
        Slot::A => "nbc/a",
        Slot::B => "nbc/b",
    }
}
