//! Content-addressed store of container images.
//!
//! Each image lives in `<root>/sha256-<hex>/` as an OCI layout with a
//! `metadata.json` side-car. The side-car is written last, so a directory
//! without one is an incomplete download and is ignored (and eligible for
//! cleanup). Mutation happens under the exclusive cache lock, reads under
//! the shared one.

mod metadata;
mod oci;

pub use metadata::CachedImage;
pub use oci::resolve_digest;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};

use nbc_api::constants::{CACHE_DIR, CACHE_LOCK_PATH, STAGED_INSTALL_DIR, STAGED_UPDATE_DIR};
use nbc_api::digest::Digest;
use nbc_api::error::{
    AmbiguousError, IoFailedError, LockHeldError, NbcError, NbcResult, NotFoundError, ReportError,
};
use osutils::lock::{FileLock, LockError, LockMode};

use crate::extract::LayerBlob;

pub struct ImageCache {
    root: PathBuf,
    lock_path: PathBuf,
}

impl ImageCache {
    /// The main image cache of the host.
    pub fn system() -> Self {
        Self::at(CACHE_DIR, CACHE_LOCK_PATH)
    }

    /// A cache of pre-staged images for installs without network access.
    pub fn staged_install() -> Self {
        Self::at(STAGED_INSTALL_DIR, CACHE_LOCK_PATH)
    }

    /// A cache holding at most one pre-staged update image.
    pub fn staged_update() -> Self {
        Self::at(STAGED_UPDATE_DIR, CACHE_LOCK_PATH)
    }

    pub fn at(root: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        ImageCache {
            root: root.into(),
            lock_path: lock_path.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.to_dir_name())
    }

    fn lock(&self, mode: LockMode) -> NbcResult<FileLock> {
        FileLock::acquire(&self.lock_path, mode).map_err(|e| match e {
            LockError::Held(path) => NbcError::new(LockHeldError::Cache { path }),
            LockError::Other(e) => NbcError::with_source(IoFailedError::CacheWrite, e),
        })
    }

    /// Resolves and downloads an image. Returns the cached copy when the
    /// digest is already present.
    pub fn download(&self, image_ref: &str) -> NbcResult<CachedImage> {
        let _lock = self.lock(LockMode::Exclusive)?;

        let digest = oci::resolve_digest(image_ref)
            .structured(IoFailedError::Download {
                reference: image_ref.to_owned(),
            })?;
        let image_dir = self.image_dir(&digest);
        if image_dir.join(metadata::METADATA_FILE).exists() {
            info!("Image '{image_ref}' already cached as {}", digest.short());
            return CachedImage::read(&image_dir).structured(IoFailedError::Read {
                path: image_dir.clone(),
            });
        }

        osutils::files::ensure_dir(&image_dir).structured(IoFailedError::CacheWrite)?;

        // Past this point a failure leaves a partial directory; remove it so
        // a later download starts clean.
        match self.populate(image_ref, &digest, &image_dir) {
            Ok(image) => Ok(image),
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&image_dir) {
                    warn!(
                        "Failed to clean up partial download at '{}': {cleanup}",
                        image_dir.display()
                    );
                }
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        image_ref: &str,
        digest: &Digest,
        image_dir: &Path,
    ) -> NbcResult<CachedImage> {
        let report = oci::pull_to_layout(image_ref, image_dir).structured(
            IoFailedError::Download {
                reference: image_ref.to_owned(),
            },
        )?;

        if &report.digest != digest {
            // The tag moved between resolve and pull; trust the pulled data.
            debug!(
                "Digest of '{image_ref}' changed during download: {} -> {}",
                digest.short(),
                report.digest.short()
            );
        }

        let image = CachedImage {
            image_ref: image_ref.to_owned(),
            image_digest: report.digest,
            download_date: Utc::now(),
            architecture: report.architecture,
            labels: report.labels,
            os_release_pretty_name: report.os_release.pretty_name,
            os_release_version_id: report.os_release.version_id,
            os_release_id: report.os_release.id,
            size_bytes: report.size_bytes,
        };
        image
            .write(image_dir)
            .structured(IoFailedError::CacheWrite)?;
        info!(
            "Cached '{image_ref}' as {} ({} bytes)",
            image.image_digest.short(),
            image.size_bytes
        );
        Ok(image)
    }

    /// Looks an image up by digest, unique digest prefix, or reference.
    pub fn get_image(&self, key: &str) -> NbcResult<CachedImage> {
        let _lock = self.lock(LockMode::Shared)?;
        let dir = self.resolve_dir(key)?;
        CachedImage::read(&dir).structured(IoFailedError::Read { path: dir })
    }

    /// Ordered layer blobs of a cached image, ready for extraction.
    pub fn layers(&self, digest: &Digest) -> NbcResult<Vec<LayerBlob>> {
        let _lock = self.lock(LockMode::Shared)?;
        let dir = self.image_dir(digest);
        oci::layout_layers(&dir).structured(IoFailedError::Read { path: dir })
    }

    /// All complete images in the cache. Directories with unreadable
    /// metadata are skipped with a warning.
    pub fn list(&self) -> NbcResult<Vec<CachedImage>> {
        let _lock = self.lock(LockMode::Shared)?;
        self.list_unlocked()
    }

    fn list_unlocked(&self) -> NbcResult<Vec<CachedImage>> {
        let mut images = Vec::new();
        for dir in self.image_dirs()? {
            match CachedImage::read(&dir) {
                Ok(image) => images.push(image),
                Err(e) => warn!("Skipping '{}': {e:#}", dir.display()),
            }
        }
        images.sort_by(|a, b| a.download_date.cmp(&b.download_date));
        Ok(images)
    }

    /// Removes one image by digest, unique prefix, or reference.
    pub fn remove(&self, key: &str) -> NbcResult<()> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let dir = self.resolve_dir(key)?;
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove '{}'", dir.display()))
            .structured(IoFailedError::CacheWrite)?;
        info!("Removed cached image at '{}'", dir.display());
        Ok(())
    }

    /// Removes every image.
    pub fn clear(&self) -> NbcResult<()> {
        let _lock = self.lock(LockMode::Exclusive)?;
        for dir in self.image_dirs()? {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove '{}'", dir.display()))
                .structured(IoFailedError::CacheWrite)?;
        }
        Ok(())
    }

    /// The single image a staged cache is expected to hold.
    pub fn get_single(&self) -> NbcResult<CachedImage> {
        let _lock = self.lock(LockMode::Shared)?;
        let mut images = self.list_unlocked()?;
        match images.len() {
            0 => Err(NbcError::new(NotFoundError::Image {
                reference: self.root.display().to_string(),
            })),
            1 => Ok(images.remove(0)),
            count => Err(NbcError::new(AmbiguousError::MultipleStagedImages { count })),
        }
    }

    fn image_dirs(&self) -> NbcResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => {
                return Err(e)
                    .context(format!("Failed to list '{}'", self.root.display()))
                    .structured(IoFailedError::Read {
                        path: self.root.clone(),
                    })
            }
        };
        for entry in entries {
            let entry = entry
                .context("Failed to read cache entry")
                .structured(IoFailedError::Read {
                    path: self.root.clone(),
                })?;
            if entry.path().is_dir() && entry.file_name().to_string_lossy().starts_with("sha256-") {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Resolution order: exact digest directory, then unique directory-name
    /// prefix, then reference equality over the metadata files.
    fn resolve_dir(&self, key: &str) -> NbcResult<PathBuf> {
        if let Ok(digest) = Digest::parse(key) {
            let dir = self.image_dir(&digest);
            if dir.is_dir() {
                return Ok(dir);
            }
        }

        let prefix = key.replacen("sha256:", "sha256-", 1);
        let matches: Vec<PathBuf> = self
            .image_dirs()?
            .into_iter()
            .filter(|dir| {
                dir.file_name()
                    .map(|name| name.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        match matches.len() {
            1 => return Ok(matches.into_iter().next().unwrap()),
            0 => {}
            count => {
                return Err(NbcError::new(AmbiguousError::DigestPrefix {
                    prefix: key.to_owned(),
                    matches: count,
                }))
            }
        }

        let by_ref: Vec<PathBuf> = self
            .image_dirs()?
            .into_iter()
            .filter(|dir| {
                CachedImage::read(dir)
                    .map(|image| image.image_ref == key)
                    .unwrap_or(false)
            })
            .collect();
        match by_ref.len() {
            0 => Err(NbcError::new(NotFoundError::Image {
                reference: key.to_owned(),
            })),
            1 => Ok(by_ref.into_iter().next().unwrap()),
            count => Err(NbcError::new(AmbiguousError::DigestPrefix {
                prefix: key.to_owned(),
                matches: count,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbc_api::error::ErrorKind;

    fn digest(fill: &str) -> Digest {
        Digest::parse(&format!("sha256:{}", fill.repeat(64 / fill.len()))).unwrap()
    }

    fn seed(cache: &ImageCache, image_ref: &str, digest: &Digest) {
        let dir = cache.image_dir(digest);
        std::fs::create_dir_all(&dir).unwrap();
        CachedImage {
            image_ref: image_ref.into(),
            image_digest: digest.clone(),
            download_date: Utc::now(),
            architecture: "amd64".into(),
            labels: Default::default(),
            os_release_pretty_name: None,
            os_release_version_id: None,
            os_release_id: None,
            size_bytes: 1,
        }
        .write(&dir)
        .unwrap();
    }

    fn test_cache(tmp: &tempfile::TempDir) -> ImageCache {
        ImageCache::at(tmp.path().join("images"), tmp.path().join("cache.lock"))
    }

    #[test]
    fn test_get_by_digest_prefix_and_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        let d = digest("ab");
        seed(&cache, "ghcr.io/test/bootc:v1", &d);

        assert_eq!(cache.get_image(d.as_str()).unwrap().image_digest, d);
        assert_eq!(cache.get_image("sha256:abab").unwrap().image_digest, d);
        assert_eq!(
            cache.get_image("ghcr.io/test/bootc:v1").unwrap().image_digest,
            d
        );
    }

    #[test]
    fn test_ambiguous_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        // Two digests sharing the prefix abc123.
        let d1 = Digest::parse(&format!("sha256:abc123{}", "0".repeat(58))).unwrap();
        let d2 = Digest::parse(&format!("sha256:abc123{}", "f".repeat(58))).unwrap();
        seed(&cache, "a:1", &d1);
        seed(&cache, "b:2", &d2);

        let err = cache.remove("sha256:abc123").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Ambiguous(_)));
        // Both survive a failed remove.
        assert_eq!(cache.list().unwrap().len(), 2);
    }

    #[test]
    fn test_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        let err = cache.get_image("sha256:dead").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_list_skips_incomplete() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        seed(&cache, "a:1", &digest("ab"));
        // A directory without metadata.json: a download that died mid-way.
        std::fs::create_dir_all(cache.root().join(digest("cd").to_dir_name())).unwrap();

        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        seed(&cache, "a:1", &digest("ab"));
        seed(&cache, "b:2", &digest("cd"));

        cache.remove("sha256:abab").unwrap();
        assert_eq!(cache.list().unwrap().len(), 1);
        cache.clear().unwrap();
        assert_eq!(cache.list().unwrap().len(), 0);
    }

    #[test]
    fn test_get_single() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        assert!(matches!(
            cache.get_single().unwrap_err().kind(),
            ErrorKind::NotFound(_)
        ));

        seed(&cache, "a:1", &digest("ab"));
        assert_eq!(cache.get_single().unwrap().image_ref, "a:1");

        seed(&cache, "b:2", &digest("cd"));
        assert!(matches!(
            cache.get_single().unwrap_err().kind(),
            ErrorKind::Ambiguous(AmbiguousError::MultipleStagedImages { count: 2 })
        ));
    }

    #[test]
    fn test_empty_cache_lists_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(&tmp);
        assert!(cache.list().unwrap().is_empty());
    }
}
