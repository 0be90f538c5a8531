use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nbc_api::digest::Digest;

/// Side-car file written next to each OCI layout directory, last in the
/// download sequence so its presence marks a complete image.
pub const METADATA_FILE: &str = "metadata.json";

/// A fully downloaded image in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImage {
    pub image_ref: String,
    pub image_digest: Digest,
    pub download_date: DateTime<Utc>,
    pub architecture: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub os_release_pretty_name: Option<String>,
    pub os_release_version_id: Option<String>,
    pub os_release_id: Option<String>,
    /// Sum of the uncompressed layer sizes.
    pub size_bytes: u64,
}

impl CachedImage {
    pub fn read(image_dir: &Path) -> Result<Self, Error> {
        let path = image_dir.join(METADATA_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse '{}'", path.display()))
    }

    pub fn write(&self, image_dir: &Path) -> Result<(), Error> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize image metadata")?;
        osutils::files::write_atomic(image_dir.join(METADATA_FILE), contents, 0o644)
    }
}
