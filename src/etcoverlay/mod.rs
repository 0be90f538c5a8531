//! Persistence of /etc across A/B slot switches.
//!
//! The image's /etc is materialized to `/.etc.lower` on each root; user
//! edits live in an overlay upper on the shared var partition; a dracut
//! hook assembles the overlay before pivot_root. A pristine snapshot of the
//! image /etc supports conflict reporting when an update ships a file the
//! user also changed.

pub mod dracut;

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use nbc_api::constants::{
    ETC_LOWER_NAME, ETC_OVERLAY_UPPER, ETC_OVERLAY_WORK, ETC_PRISTINE_DIR, TMPFILES_PATH,
};
use nbc_api::error::{IoFailedError, NbcResult, ReportError};
use osutils::path::join_relative;

use crate::assets;

/// Copies the freshly extracted `<root>/etc` verbatim to `<root>/.etc.lower`.
/// A second run replaces the old snapshot, so files dropped from the image
/// disappear from the lowerdir too.
pub fn populate_etc_lower(target_root: &Path) -> NbcResult<()> {
    let source = target_root.join("etc");
    let dest = target_root.join(ETC_LOWER_NAME);

    info!("Populating '{}'", dest.display());
    if dest.exists() {
        fs::remove_dir_all(&dest)
            .with_context(|| format!("Failed to clear '{}'", dest.display()))
            .structured(IoFailedError::PopulateTree { path: dest.clone() })?;
    }
    copy_tree(&source, &dest).structured(IoFailedError::PopulateTree { path: dest })
}

/// Snapshots the image /etc to the pristine directory on var, the baseline
/// for the next update's conflict report.
pub fn snapshot_pristine(target_root: &Path, var_root: &Path) -> NbcResult<()> {
    let source = target_root.join("etc");
    let dest = join_relative(var_root, ETC_PRISTINE_DIR);

    if dest.exists() {
        fs::remove_dir_all(&dest)
            .with_context(|| format!("Failed to clear '{}'", dest.display()))
            .structured(IoFailedError::PopulateTree { path: dest.clone() })?;
    }
    copy_tree(&source, &dest).structured(IoFailedError::PopulateTree { path: dest })
}

/// Reserves the overlay upper and work directories on the var filesystem.
/// They are shared across slots; an update finds them already present.
pub fn reserve_overlay_dirs(var_root: &Path) -> NbcResult<()> {
    for dir in [ETC_OVERLAY_UPPER, ETC_OVERLAY_WORK] {
        let path = join_relative(var_root, dir);
        osutils::files::ensure_dir(&path)
            .structured(IoFailedError::PopulateTree { path: path.clone() })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to chmod '{}'", path.display()))
            .structured(IoFailedError::PopulateTree { path })?;
    }
    Ok(())
}

/// First-boot machine-id handling: the literal `uninitialized` makes systemd
/// generate a fresh id and run first-boot units. An id the image already
/// carries would be cloned onto every installed machine, which is exactly
/// what we refuse to do silently.
pub fn write_machine_id(target_root: &Path) -> NbcResult<()> {
    let path = target_root.join("etc/machine-id");
    let existing = fs::read_to_string(&path).unwrap_or_default();
    let trimmed = existing.trim();

    if trimmed.is_empty() || trimmed == "uninitialized" {
        osutils::files::write_atomic(&path, "uninitialized\n", 0o444)
            .structured(IoFailedError::WriteFile { path })?;
    } else {
        warn!("Image ships a machine-id ('{trimmed}'); leaving it untouched");
    }
    Ok(())
}

/// Installs the tmpfiles.d fragment that creates `/run/nbc-booted`.
pub fn install_tmpfiles(target_root: &Path) -> NbcResult<()> {
    let path = join_relative(target_root, TMPFILES_PATH);
    osutils::files::write_atomic(&path, assets::tmpfiles_conf(), 0o644)
        .structured(IoFailedError::WriteFile { path })
}

/// A file both the user and the new image changed. User side wins; the
/// conflict is only reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcConflict {
    pub path: PathBuf,
}

/// Compares the overlay upper against the pristine snapshot and the new
/// image's /etc: a user-modified file whose image copy changed size between
/// pristine and new is a conflict.
pub fn detect_conflicts(
    upper: &Path,
    pristine_etc: &Path,
    new_etc: &Path,
) -> NbcResult<Vec<EtcConflict>> {
    let mut conflicts = Vec::new();
    if !upper.is_dir() {
        return Ok(conflicts);
    }
    collect_conflicts(upper, Path::new(""), pristine_etc, new_etc, &mut conflicts)
        .structured(IoFailedError::Read {
            path: upper.to_owned(),
        })?;
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(conflicts)
}

fn collect_conflicts(
    upper_dir: &Path,
    relative: &Path,
    pristine_etc: &Path,
    new_etc: &Path,
    conflicts: &mut Vec<EtcConflict>,
) -> Result<(), Error> {
    for entry in fs::read_dir(upper_dir)
        .with_context(|| format!("Failed to list '{}'", upper_dir.display()))?
    {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_conflicts(&entry.path(), &rel, pristine_etc, new_etc, conflicts)?;
        } else if meta.is_file() {
            let pristine = pristine_etc.join(&rel);
            let new = new_etc.join(&rel);
            let (Ok(p_meta), Ok(n_meta)) = (fs::metadata(&pristine), fs::metadata(&new)) else {
                continue;
            };
            if p_meta.len() != n_meta.len() {
                debug!("Conflict: '{}' changed in both image and overlay", rel.display());
                conflicts.push(EtcConflict { path: rel });
            }
        }
    }
    Ok(())
}

/// Recursive verbatim copy preserving modes and symlinks (not followed).
fn copy_tree(source: &Path, dest: &Path) -> Result<(), Error> {
    let meta = fs::symlink_metadata(source)
        .with_context(|| format!("Failed to stat '{}'", source.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("Failed to create '{}'", dest.display()))?;
    fs::set_permissions(dest, meta.permissions())
        .with_context(|| format!("Failed to chmod '{}'", dest.display()))?;

    for entry in
        fs::read_dir(source).with_context(|| format!("Failed to list '{}'", source.display()))?
    {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let meta = entry.metadata()?;

        if meta.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if meta.file_type().is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link '{}'", entry.path().display()))?;
            symlink(&link, &target).with_context(|| {
                format!("Failed to symlink '{}' -> '{}'", target.display(), link.display())
            })?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy '{}'", entry.path().display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_populate_etc_lower_replaces_stale_contents() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("etc/hostname"), "host-a");
        write(&root.path().join("etc/ssh/sshd_config"), "Port 22");

        populate_etc_lower(root.path()).unwrap();
        let lower = root.path().join(".etc.lower");
        assert_eq!(fs::read_to_string(lower.join("hostname")).unwrap(), "host-a");

        // New image /etc drops sshd_config and adds issue.
        fs::remove_dir_all(root.path().join("etc/ssh")).unwrap();
        write(&root.path().join("etc/issue"), "welcome");
        populate_etc_lower(root.path()).unwrap();

        assert!(!lower.join("ssh").exists());
        assert_eq!(fs::read_to_string(lower.join("issue")).unwrap(), "welcome");
    }

    #[test]
    fn test_populate_preserves_symlinks_and_modes() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("etc/shadow"), "secret");
        fs::set_permissions(
            root.path().join("etc/shadow"),
            fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        symlink("../usr/lib/os-release", root.path().join("etc/os-release")).unwrap();

        populate_etc_lower(root.path()).unwrap();
        let lower = root.path().join(".etc.lower");

        let mode = fs::metadata(lower.join("shadow")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            fs::read_link(lower.join("os-release")).unwrap(),
            Path::new("../usr/lib/os-release")
        );
    }

    #[test]
    fn test_machine_id_first_boot() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();

        // Absent.
        write_machine_id(root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/machine-id")).unwrap(),
            "uninitialized\n"
        );

        // Empty file gets the same treatment.
        fs::remove_file(root.path().join("etc/machine-id")).unwrap();
        write(&root.path().join("etc/machine-id"), "");
        write_machine_id(root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/machine-id")).unwrap(),
            "uninitialized\n"
        );
    }

    #[test]
    fn test_machine_id_existing_untouched() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join("etc/machine-id"),
            "0123456789abcdef0123456789abcdef\n",
        );
        write_machine_id(root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/machine-id")).unwrap(),
            "0123456789abcdef0123456789abcdef\n"
        );
    }

    #[test]
    fn test_reserve_overlay_dirs() {
        let var = tempfile::tempdir().unwrap();
        reserve_overlay_dirs(var.path()).unwrap();
        let upper = var.path().join("var/lib/nbc/etc-overlay/upper");
        assert!(upper.is_dir());
        assert_eq!(
            fs::metadata(&upper).unwrap().permissions().mode() & 0o777,
            0o700
        );
        assert!(var.path().join("var/lib/nbc/etc-overlay/work").is_dir());
    }

    #[test]
    fn test_detect_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let upper = tmp.path().join("upper");
        let pristine = tmp.path().join("pristine");
        let new = tmp.path().join("new");

        // User edited sshd_config; the image also changed it (size differs).
        write(&upper.join("ssh/sshd_config"), "Port 2222");
        write(&pristine.join("ssh/sshd_config"), "Port 22");
        write(&new.join("ssh/sshd_config"), "Port 22\nUseDNS no");

        // User edited motd; image copy unchanged.
        write(&upper.join("motd"), "hi");
        write(&pristine.join("motd"), "welcome");
        write(&new.join("motd"), "welcome");

        // User-only file, not in any image.
        write(&upper.join("local.conf"), "x=1");

        let conflicts = detect_conflicts(&upper, &pristine, &new).unwrap();
        assert_eq!(
            conflicts,
            vec![EtcConflict {
                path: PathBuf::from("ssh/sshd_config")
            }]
        );
    }

    #[test]
    fn test_install_tmpfiles() {
        let root = tempfile::tempdir().unwrap();
        install_tmpfiles(root.path()).unwrap();
        let contents =
            fs::read_to_string(root.path().join("usr/lib/tmpfiles.d/nbc.conf")).unwrap();
        assert_eq!(contents, "f /run/nbc-booted 0644 root root - nbc\n");
    }
}
