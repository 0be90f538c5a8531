//! Materializes a container image onto a root filesystem.
//!
//! Layers are applied in manifest order with OverlayFS whiteout semantics:
//! a `.wh.<name>` entry deletes `<name>` from the target, and a
//! `.wh..wh..opq` entry empties its directory before the rest of the layer
//! is applied. Marker files are never materialized.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};
use oci_spec::image::MediaType;

use nbc_api::constants::MIN_EXTRACTED_SIZE_BYTES;
use nbc_api::error::{IoFailedError, NbcError, NbcResult, ReportError, VerificationFailedError};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One layer blob of an image, in manifest order.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub media_type: MediaType,
    pub path: PathBuf,
}

/// Applies all layers onto `target` in order.
pub fn extract_layers(layers: &[LayerBlob], target: &Path) -> NbcResult<()> {
    info!(
        "Extracting {} layers to '{}'",
        layers.len(),
        target.display()
    );
    for (index, layer) in layers.iter().enumerate() {
        debug!(
            "Applying layer {} of {} ({})",
            index + 1,
            layers.len(),
            layer.path.display()
        );
        apply_layer(layer, target).structured(IoFailedError::ExtractLayer { layer: index })?;
    }
    Ok(())
}

fn apply_layer(layer: &LayerBlob, target: &Path) -> Result<(), Error> {
    let file = File::open(&layer.path)
        .with_context(|| format!("Failed to open layer blob '{}'", layer.path.display()))?;
    let reader = decompress(&layer.media_type, file)?;
    apply_tar(reader, target)
}

/// Wraps the blob reader in the decompressor its media type calls for.
pub fn decompress(media_type: &MediaType, file: File) -> Result<Box<dyn Read>, Error> {
    Ok(match media_type {
        MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => {
            Box::new(flate2::read::GzDecoder::new(file))
        }
        MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => {
            Box::new(zstd::stream::Decoder::new(file).context("Failed to initialize zstd")?)
        }
        MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Box::new(file),
        MediaType::Other(t) if t.ends_with(".tar.gzip") => {
            Box::new(flate2::read::GzDecoder::new(file))
        }
        MediaType::Other(t) if t.ends_with(".tar.zstd") => {
            Box::new(zstd::stream::Decoder::new(file).context("Failed to initialize zstd")?)
        }
        MediaType::Other(t) if t.ends_with(".tar") => Box::new(file),
        other => bail!("Unsupported layer media type '{other}'"),
    })
}

/// Applies a single uncompressed tar stream onto `target`.
pub fn apply_tar(reader: impl Read, target: &Path) -> Result<(), Error> {
    let mut archive = tar::Archive::new(reader);
    let apply_ownership = nix::unistd::Uid::effective().is_root();

    for entry in archive.entries().context("Failed to read tar entries")? {
        let mut entry = entry.context("Failed to read tar entry")?;
        let entry_path = entry.path().context("Failed to decode entry path")?.into_owned();

        let relative = sanitize(&entry_path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(&relative);

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Whiteouts are instructions, not files.
        if file_name == OPAQUE_WHITEOUT {
            clear_directory(dest.parent().unwrap_or(target))?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = dest.parent().unwrap_or(target).join(hidden);
            remove_any(&victim)?;
            continue;
        }

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().context("Failed to read entry mode")?;
        let uid = entry.header().uid().context("Failed to read uid")? as u32;
        let gid = entry.header().gid().context("Failed to read gid")? as u32;

        match entry_type {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create '{}'", dest.display()))?;
                // Applied after creation so SGID and sticky bits stick.
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Failed to chmod '{}'", dest.display()))?;
            }
            tar::EntryType::Regular => {
                prepare_destination(&dest)?;
                let mut out = File::create(&dest)
                    .with_context(|| format!("Failed to create '{}'", dest.display()))?;
                io::copy(&mut entry, &mut out)
                    .with_context(|| format!("Failed to write '{}'", dest.display()))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Failed to chmod '{}'", dest.display()))?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name_bytes()
                    .context("Symlink entry has no target")?;
                let link = Path::new(OsStr::from_bytes(&link)).to_owned();
                prepare_destination(&dest)?;
                // Preserved literally, absolute and dotdot targets included.
                symlink(&link, &dest).with_context(|| {
                    format!("Failed to symlink '{}' -> '{}'", dest.display(), link.display())
                })?;
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .context("Failed to decode link target")?
                    .context("Hard link entry has no target")?;
                let source = target.join(sanitize(&link)?);
                prepare_destination(&dest)?;
                fs::hard_link(&source, &dest).with_context(|| {
                    format!(
                        "Failed to hard link '{}' -> '{}'",
                        dest.display(),
                        source.display()
                    )
                })?;
            }
            other => {
                debug!(
                    "Skipping unsupported entry type {:?} at '{}'",
                    other,
                    relative.display()
                );
                continue;
            }
        }

        if apply_ownership {
            if let Err(e) = std::os::unix::fs::lchown(&dest, Some(uid), Some(gid)) {
                warn!("Failed to chown '{}' to {uid}:{gid}: {e}", dest.display());
            }
        }
    }
    Ok(())
}

/// Normalizes an archive path and rejects anything that would land outside
/// the extraction root.
fn sanitize(path: &Path) -> Result<PathBuf, Error> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(NbcError::new(VerificationFailedError::PathEscape {
                    path: path.to_owned(),
                })
                .unstructured("Refusing to extract entry"));
            }
        }
    }
    Ok(clean)
}

/// Makes room for a fresh entry: removes whatever occupies the path and
/// ensures the parent directory exists.
fn prepare_destination(dest: &Path) -> Result<(), Error> {
    remove_any(dest)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove '{}'", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to remove '{}'", path.display())),
        Err(_) => Ok(()),
    }
}

fn clear_directory(dir: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list '{}'", dir.display()))? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

/// Total size of all regular files under `root`, without following symlinks.
pub fn tree_size(root: &Path) -> Result<u64, Error> {
    let mut total = 0;
    for entry in fs::read_dir(root).with_context(|| format!("Failed to list '{}'", root.display()))? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += tree_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Sanity checks an extracted root: the expected skeleton exists, os-release
/// is readable, and the tree is at least plausibly sized.
pub fn verify_extraction(target: &Path) -> NbcResult<()> {
    verify_extraction_with_minimum(target, MIN_EXTRACTED_SIZE_BYTES)
}

pub fn verify_extraction_with_minimum(target: &Path, minimum: u64) -> NbcResult<()> {
    for dir in ["usr", "usr/bin", "usr/lib", "etc"] {
        if !target.join(dir).is_dir() {
            return Err(NbcError::new(VerificationFailedError::MissingDirectory {
                dir: dir.to_owned(),
            }));
        }
    }

    fs::read_to_string(target.join("usr/lib/os-release"))
        .map_err(anyhow::Error::from)
        .structured(VerificationFailedError::MissingOsRelease)?;

    let size = tree_size(target)
        .structured(IoFailedError::Read {
            path: target.to_owned(),
        })?;
    if size < minimum {
        return Err(NbcError::new(VerificationFailedError::RootTooSmall {
            size,
            minimum,
        }));
    }

    info!(
        "Verified extracted root at '{}' ({} bytes)",
        target.display(),
        size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_path(path).unwrap();
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn dir_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_path(path).unwrap();
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();
    }

    fn symlink_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, link: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(0o777);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        builder.append_link(&mut header, path, link).unwrap();
    }

    // tar::Header::set_path() refuses paths containing "..", but a crafted
    // archive isn't bound by that API. Writes the raw name bytes so tests
    // can reproduce what `sanitize()` must defend against.
    fn raw_path_file_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        let name_bytes = path.as_bytes();
        header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn apply(builder: tar::Builder<Vec<u8>>, target: &Path) -> Result<(), Error> {
        let data = builder.into_inner().unwrap();
        apply_tar(Cursor::new(data), target)
    }

    #[test]
    fn test_whiteout_deletes_file() {
        let target = tempfile::tempdir().unwrap();

        let mut base = tar::Builder::new(Vec::new());
        dir_entry(&mut base, "dir", 0o755);
        file_entry(&mut base, "dir/file.txt", 0o644, b"hello");
        apply(base, target.path()).unwrap();
        assert!(target.path().join("dir/file.txt").exists());

        let mut upper = tar::Builder::new(Vec::new());
        file_entry(&mut upper, "dir/.wh.file.txt", 0o644, b"");
        apply(upper, target.path()).unwrap();

        assert!(!target.path().join("dir/file.txt").exists());
        assert!(!target.path().join("dir/.wh.file.txt").exists());
        assert!(target.path().join("dir").is_dir());
    }

    #[test]
    fn test_whiteout_deletes_directory_recursively() {
        let target = tempfile::tempdir().unwrap();

        let mut base = tar::Builder::new(Vec::new());
        dir_entry(&mut base, "opt/sub", 0o755);
        file_entry(&mut base, "opt/sub/inner.txt", 0o644, b"x");
        apply(base, target.path()).unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        file_entry(&mut upper, "opt/.wh.sub", 0o644, b"");
        apply(upper, target.path()).unwrap();

        assert!(!target.path().join("opt/sub").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_then_applies() {
        let target = tempfile::tempdir().unwrap();

        let mut base = tar::Builder::new(Vec::new());
        dir_entry(&mut base, "dir", 0o755);
        file_entry(&mut base, "dir/old1.txt", 0o644, b"1");
        file_entry(&mut base, "dir/old2.txt", 0o644, b"2");
        apply(base, target.path()).unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        file_entry(&mut upper, "dir/.wh..wh..opq", 0o644, b"");
        file_entry(&mut upper, "dir/newfile.txt", 0o644, b"new");
        apply(upper, target.path()).unwrap();

        let names: Vec<_> = fs::read_dir(target.path().join("dir"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["newfile.txt"]);
    }

    #[test]
    fn test_special_bits_preserved() {
        let target = tempfile::tempdir().unwrap();

        let mut layer = tar::Builder::new(Vec::new());
        file_entry(&mut layer, "usr/bin/suid", 0o4755, b"#!/bin/sh\n");
        file_entry(&mut layer, "usr/bin/sgid", 0o2755, b"#!/bin/sh\n");
        file_entry(&mut layer, "usr/bin/both", 0o6755, b"#!/bin/sh\n");
        dir_entry(&mut layer, "tmp", 0o1777);
        apply(layer, target.path()).unwrap();

        let mode = |p: &str| {
            fs::metadata(target.path().join(p))
                .unwrap()
                .permissions()
                .mode()
                & 0o7777
        };
        assert_eq!(mode("usr/bin/suid"), 0o4755);
        assert_eq!(mode("usr/bin/sgid"), 0o2755);
        assert_eq!(mode("usr/bin/both"), 0o6755);
        assert_eq!(mode("tmp"), 0o1777);
    }

    #[test]
    fn test_symlinks_preserved_literally() {
        let target = tempfile::tempdir().unwrap();

        let mut layer = tar::Builder::new(Vec::new());
        dir_entry(&mut layer, "etc", 0o755);
        symlink_entry(&mut layer, "etc/os-release", "../usr/lib/os-release");
        symlink_entry(&mut layer, "bin", "/usr/bin");
        apply(layer, target.path()).unwrap();

        assert_eq!(
            fs::read_link(target.path().join("etc/os-release")).unwrap(),
            Path::new("../usr/lib/os-release")
        );
        assert_eq!(
            fs::read_link(target.path().join("bin")).unwrap(),
            Path::new("/usr/bin")
        );
    }

    #[test]
    fn test_hard_links() {
        let target = tempfile::tempdir().unwrap();

        let mut layer = tar::Builder::new(Vec::new());
        file_entry(&mut layer, "usr/bin/gzip", 0o755, b"ELF");
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Link);
        header.set_mode(0o755);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        layer
            .append_link(&mut header, "usr/bin/gunzip", "usr/bin/gzip")
            .unwrap();
        apply(layer, target.path()).unwrap();

        let a = fs::metadata(target.path().join("usr/bin/gzip")).unwrap();
        let b = fs::metadata(target.path().join("usr/bin/gunzip")).unwrap();
        assert_eq!(
            std::os::unix::fs::MetadataExt::ino(&a),
            std::os::unix::fs::MetadataExt::ino(&b)
        );
    }

    #[test]
    fn test_path_escape_rejected() {
        let target = tempfile::tempdir().unwrap();

        let mut layer = tar::Builder::new(Vec::new());
        raw_path_file_entry(&mut layer, "dir/../../evil", 0o644, b"nope");
        apply(layer, target.path()).unwrap_err();
        assert!(!target.path().parent().unwrap().join("evil").exists());
    }

    #[test]
    fn test_later_layer_overwrites() {
        let target = tempfile::tempdir().unwrap();

        let mut base = tar::Builder::new(Vec::new());
        file_entry(&mut base, "etc/hostname", 0o644, b"old");
        apply(base, target.path()).unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        file_entry(&mut upper, "etc/hostname", 0o644, b"new");
        apply(upper, target.path()).unwrap();

        assert_eq!(
            fs::read_to_string(target.path().join("etc/hostname")).unwrap(),
            "new"
        );
    }

    #[test]
    fn test_verify_extraction() {
        let target = tempfile::tempdir().unwrap();
        for dir in ["usr/bin", "usr/lib", "etc"] {
            fs::create_dir_all(target.path().join(dir)).unwrap();
        }
        fs::write(target.path().join("usr/lib/os-release"), "ID=test\n").unwrap();
        fs::write(target.path().join("usr/bin/payload"), vec![0u8; 4096]).unwrap();

        verify_extraction_with_minimum(target.path(), 1024).unwrap();

        // Too small for the real threshold.
        let err = verify_extraction_with_minimum(target.path(), u64::MAX).unwrap_err();
        assert!(matches!(
            err.kind(),
            nbc_api::error::ErrorKind::VerificationFailed(
                VerificationFailedError::RootTooSmall { .. }
            )
        ));
    }

    #[test]
    fn test_verify_missing_os_release() {
        let target = tempfile::tempdir().unwrap();
        for dir in ["usr/bin", "usr/lib", "etc"] {
            fs::create_dir_all(target.path().join(dir)).unwrap();
        }
        let err = verify_extraction_with_minimum(target.path(), 0).unwrap_err();
        assert!(matches!(
            err.kind(),
            nbc_api::error::ErrorKind::VerificationFailed(
                VerificationFailedError::MissingOsRelease
            )
        ));
    }
}
