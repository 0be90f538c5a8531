//! Installs the etc-overlay dracut module into a target root and keeps the
//! initramfs there in sync with it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use nbc_api::constants::{DRACUT_HOOK_NAME, DRACUT_MODULE_DIR};
use nbc_api::error::{IoFailedError, NbcError, NbcResult, NotFoundError, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;
use osutils::path::join_relative;

use crate::assets;

/// Kernel found on an extracted root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub version: String,
    /// Absolute path of vmlinuz on the target root.
    pub vmlinuz: PathBuf,
    /// Absolute path the initramfs is generated at on the target root.
    pub initramfs: PathBuf,
}

/// Writes `module-setup.sh` and the pre-pivot hook under
/// `usr/lib/dracut/modules.d/95etc-overlay/` on the target root.
pub fn install_module(target_root: &Path) -> NbcResult<()> {
    let module_dir = join_relative(target_root, DRACUT_MODULE_DIR);
    osutils::files::ensure_dir(&module_dir).structured(IoFailedError::PopulateTree {
        path: module_dir.clone(),
    })?;

    for (name, contents) in [
        ("module-setup.sh", assets::dracut_module_setup()),
        (DRACUT_HOOK_NAME, assets::dracut_overlay_hook()),
    ] {
        let path = module_dir.join(name);
        osutils::files::write_atomic(&path, contents, 0o755)
            .structured(IoFailedError::WriteFile { path })?;
    }
    info!("Installed dracut module at '{}'", module_dir.display());
    Ok(())
}

/// Locates the kernel on an extracted root: `usr/lib/modules/<kver>/vmlinuz`
/// first (bootc image layout), `boot/vmlinuz-<kver>` as fallback.
pub fn find_kernel(target_root: &Path) -> NbcResult<KernelImage> {
    let modules_dir = target_root.join("usr/lib/modules");
    let mut versions: Vec<String> = match fs::read_dir(&modules_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    versions.sort();

    let Some(version) = versions.pop() else {
        return Err(NbcError::new(NotFoundError::Kernel {
            root: target_root.to_owned(),
        }));
    };

    let candidates = [
        modules_dir.join(&version).join("vmlinuz"),
        target_root.join(format!("boot/vmlinuz-{version}")),
    ];
    let vmlinuz = candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| {
            NbcError::new(NotFoundError::Kernel {
                root: target_root.to_owned(),
            })
        })?;

    Ok(KernelImage {
        initramfs: target_root.join(format!("boot/initramfs-{version}.img")),
        vmlinuz,
        version,
    })
}

/// Whether an initramfs already contains the etc-overlay hook. A listing
/// tool that errors after revealing the hook still counts as found; the
/// error is logged and swallowed.
pub fn initramfs_has_hook(adapter: &dyn OsAdapter, initramfs: &Path) -> bool {
    for tool in [Dependency::Lsinitrd, Dependency::Lsinitramfs] {
        match adapter.run_output(tool, &cmd_args![initramfs]) {
            Ok(listing) => return listing.contains(DRACUT_HOOK_NAME),
            Err(e) => {
                let rendered = format!("{e:#}");
                if rendered.contains(DRACUT_HOOK_NAME) {
                    warn!("{} failed but listed the hook: {rendered}", tool.name());
                    return true;
                }
                debug!("{} could not inspect '{}': {rendered}", tool.name(), initramfs.display());
            }
        }
    }
    false
}

/// Regenerates the initramfs of `kernel` inside a chroot of the target root,
/// unless the existing one already carries the hook.
///
/// Returns `false` when regeneration was skipped.
pub fn regenerate_initramfs(
    adapter: &dyn OsAdapter,
    target_root: &Path,
    kernel: &KernelImage,
) -> NbcResult<bool> {
    if kernel.initramfs.is_file() && initramfs_has_hook(adapter, &kernel.initramfs) {
        info!(
            "Initramfs '{}' already has the etc-overlay module",
            kernel.initramfs.display()
        );
        return Ok(false);
    }

    let _mounts = ChrootMounts::enter(adapter, target_root)?;

    let initramfs_in_chroot = format!("/boot/initramfs-{}.img", kernel.version);
    adapter
        .run_checked(
            Dependency::Chroot,
            &cmd_args![
                target_root,
                "dracut",
                "--force",
                "--add",
                "etc-overlay",
                initramfs_in_chroot,
                &kernel.version
            ],
        )
        .structured(IoFailedError::RegenerateInitramfs)?;
    Ok(true)
}

/// Bind mounts of /dev, /proc, /sys into a chroot, released in reverse
/// order on drop, every exit path included.
struct ChrootMounts<'a> {
    adapter: &'a dyn OsAdapter,
    mounted: Vec<PathBuf>,
}

impl<'a> ChrootMounts<'a> {
    fn enter(adapter: &'a dyn OsAdapter, target_root: &Path) -> NbcResult<Self> {
        let mut mounts = ChrootMounts {
            adapter,
            mounted: Vec::new(),
        };
        for dir in ["/dev", "/proc", "/sys"] {
            let target = join_relative(target_root, dir);
            osutils::files::ensure_dir(&target).structured(IoFailedError::Mount {
                device: PathBuf::from(dir),
                target: target.clone(),
            })?;
            adapter
                .run_checked(
                    Dependency::Mount,
                    &cmd_args!["--rbind", "--make-rprivate", dir, &target],
                )
                .structured(IoFailedError::Mount {
                    device: PathBuf::from(dir),
                    target: target.clone(),
                })?;
            mounts.mounted.push(target);
        }
        Ok(mounts)
    }
}

impl Drop for ChrootMounts<'_> {
    fn drop(&mut self) {
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = self
                .adapter
                .run_checked(Dependency::Umount, &cmd_args!["-R", &target])
            {
                warn!("Failed to release bind mount '{}': {e:#}", target.display());
            }
        }
    }
}
