// Canonical paths and layout constants.

use const_format::formatcp;

/// State directory of the installed system.
pub const STATE_DIR: &str = "/var/lib/nbc/state";

/// The system configuration record.
pub const CONFIG_PATH: &str = formatcp!("{STATE_DIR}/config.json");

/// Older locations of the configuration record, read as fallback and removed
/// on the next successful write.
pub const LEGACY_CONFIG_PATHS: &[&str] = &[
    "/etc/nbc/config.json",
    "/var/lib/nbc/etc-overlay/upper/nbc/config.json",
];

/// Persistent overlay directories for /etc, shared across slots on var.
pub const ETC_OVERLAY_DIR: &str = "/var/lib/nbc/etc-overlay";
pub const ETC_OVERLAY_UPPER: &str = formatcp!("{ETC_OVERLAY_DIR}/upper");
pub const ETC_OVERLAY_WORK: &str = formatcp!("{ETC_OVERLAY_DIR}/work");

/// Pristine snapshot of the image /etc, used for conflict detection.
pub const ETC_PRISTINE_DIR: &str = "/var/lib/nbc/etc.pristine";

/// Materialized image /etc on each root filesystem (the overlay lowerdir).
pub const ETC_LOWER_NAME: &str = ".etc.lower";

/// Image cache roots.
pub const CACHE_DIR: &str = "/var/cache/nbc/images";
pub const STAGED_INSTALL_DIR: &str = "/var/cache/nbc/staged-install";
pub const STAGED_UPDATE_DIR: &str = "/var/cache/nbc/staged-update";

/// Lock files. Whole-file advisory flocks, non-blocking.
pub const LOCK_DIR: &str = "/var/run/nbc";
pub const CACHE_LOCK_PATH: &str = formatcp!("{LOCK_DIR}/cache.lock");
pub const SYSTEM_LOCK_PATH: &str = formatcp!("{LOCK_DIR}/system.lock");

/// Runtime marker created by tmpfiles.d on every boot of an nbc system.
pub const BOOTED_MARKER_PATH: &str = "/run/nbc-booted";

/// Pending-update record, cleared by reboot (tmpfs).
pub const REBOOT_REQUIRED_PATH: &str = "/run/nbc-reboot-required";

/// tmpfiles.d fragment installed into the image.
pub const TMPFILES_PATH: &str = "/usr/lib/tmpfiles.d/nbc.conf";

/// Dracut module that mounts the /etc overlay before pivot_root.
pub const DRACUT_MODULE_NAME: &str = "95etc-overlay";
pub const DRACUT_MODULE_DIR: &str = formatcp!("/usr/lib/dracut/modules.d/{DRACUT_MODULE_NAME}");
pub const DRACUT_HOOK_NAME: &str = "etc-overlay-mount.sh";

/// Fixed GPT layout.
pub const ESP_LABEL: &str = "UEFI";
pub const ROOT1_LABEL: &str = "root1";
pub const ROOT2_LABEL: &str = "root2";
pub const VAR_LABEL: &str = "var";

pub const ESP_SIZE_MIB: u64 = 2048;
pub const ROOT_SIZE_MIB: u64 = 12288;

/// sgdisk type codes. Roots and var are generic Linux data on purpose: slot
/// selection is explicit via the kernel cmdline, never auto-discovered.
pub const ESP_TYPE_CODE: &str = "ef00";
pub const LINUX_TYPE_CODE: &str = "8300";

/// Minimum plausible size of an extracted root tree.
pub const MIN_EXTRACTED_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Record written onto each root at extraction time naming the image it
/// carries. Boot confirmation compares it against the system configuration.
pub const IMAGE_MARKER_NAME: &str = ".nbc-image.json";
