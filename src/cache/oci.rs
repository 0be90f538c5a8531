//! Registry pulls into OCI-layout directories.
//!
//! Remote access goes through `oci-client` driven by a dedicated tokio
//! runtime, so the rest of the installer stays blocking.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Error};
use log::{debug, trace};
use oci_client::{
    client::{ClientConfig, ImageLayer},
    manifest::ImageIndexEntry,
    secrets::RegistryAuth,
    Client as OciClient, Reference,
};
use oci_spec::image::{
    DescriptorBuilder, ImageConfiguration, ImageIndexBuilder, ImageManifest, ImageManifestBuilder,
    MediaType, Sha256Digest,
};
use tokio::runtime::Runtime;

use nbc_api::digest::Digest;
use osutils::osrelease::OsRelease;

use crate::extract;

/// Annotation carrying the original reference in the layout index.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_FILE_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}\n";

const ACCEPTED_LAYER_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.diff.tar",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// What a completed pull learned about the image, beyond the blobs on disk.
#[derive(Debug)]
pub struct PullReport {
    pub digest: Digest,
    pub architecture: String,
    pub labels: BTreeMap<String, String>,
    pub os_release: OsRelease,
    pub size_bytes: u64,
}

/// Resolves a reference to its manifest digest without downloading layers.
pub fn resolve_digest(image_ref: &str) -> Result<Digest, Error> {
    let reference = parse_reference(image_ref)?;
    let runtime = Runtime::new().context("Failed to create tokio runtime")?;
    let client = new_client();
    let digest = runtime
        .block_on(client.fetch_manifest_digest(&reference, &RegistryAuth::Anonymous))
        .with_context(|| format!("Failed to resolve '{image_ref}'"))?;
    Digest::parse(&digest).map_err(|e| e.unstructured("Registry returned an unusable digest"))
}

/// Pulls `image_ref` and writes a complete OCI layout under `layout_dir`
/// (blobs, manifest, index.json, oci-layout).
pub fn pull_to_layout(image_ref: &str, layout_dir: &Path) -> Result<PullReport, Error> {
    let reference = parse_reference(image_ref)?;
    let runtime = Runtime::new().context("Failed to create tokio runtime")?;
    let client = new_client();

    debug!("Pulling '{image_ref}'");
    let image = runtime
        .block_on(client.pull(
            &reference,
            &RegistryAuth::Anonymous,
            ACCEPTED_LAYER_TYPES.to_vec(),
        ))
        .with_context(|| format!("Failed to pull '{image_ref}'"))?;

    let digest = match image.digest.as_deref() {
        Some(d) => Digest::parse(d)
            .map_err(|e| e.unstructured("Registry returned an unusable digest"))?,
        None => {
            let d = runtime
                .block_on(client.fetch_manifest_digest(&reference, &RegistryAuth::Anonymous))
                .with_context(|| format!("Failed to resolve '{image_ref}'"))?;
            Digest::parse(&d).map_err(|e| e.unstructured("Registry returned an unusable digest"))?
        }
    };

    let blobs_dir = layout_dir.join("blobs/sha256");
    osutils::files::ensure_dir(&blobs_dir)?;

    // Config blob: architecture and labels come from here.
    let config_digest = write_blob(&blobs_dir, &image.config.data)?;
    let config: ImageConfiguration = serde_json::from_slice(&image.config.data)
        .context("Failed to parse image configuration")?;
    let architecture = config.architecture().to_string();
    let labels = config
        .config()
        .as_ref()
        .and_then(|c| c.labels().clone())
        .map(|l| l.into_iter().collect())
        .unwrap_or_default();

    // Layer blobs, in manifest order.
    let mut layer_descriptors = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        let layer_digest = write_blob(&blobs_dir, &layer.data)?;
        layer_descriptors.push(
            DescriptorBuilder::default()
                .media_type(MediaType::from(layer.media_type.as_str()))
                .digest(layer_digest)
                .size(layer.data.len() as u64)
                .build()
                .context("Failed to build layer descriptor")?,
        );
    }

    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(config_digest)
        .size(image.config.data.len() as u64)
        .build()
        .context("Failed to build config descriptor")?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()
        .context("Failed to build image manifest")?;
    let manifest_bytes =
        serde_json::to_vec(&manifest).context("Failed to serialize image manifest")?;
    let manifest_digest = write_blob(&blobs_dir, &manifest_bytes)?;

    let manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_digest)
        .size(manifest_bytes.len() as u64)
        .annotations(std::collections::HashMap::from([(
            REF_NAME_ANNOTATION.to_owned(),
            image_ref.to_owned(),
        )]))
        .build()
        .context("Failed to build manifest descriptor")?;

    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(vec![manifest_descriptor])
        .build()
        .context("Failed to build image index")?;
    index
        .to_file_pretty(layout_dir.join("index.json"))
        .context("Failed to write index.json")?;

    std::fs::write(layout_dir.join("oci-layout"), OCI_LAYOUT_FILE_CONTENT)
        .context("Failed to write oci-layout")?;

    let (size_bytes, os_release) = scan_layers(&image.layers)?;

    Ok(PullReport {
        digest,
        architecture,
        labels,
        os_release,
        size_bytes,
    })
}

/// Loads the ordered layer blobs of the (single) manifest in a layout.
pub fn layout_layers(layout_dir: &Path) -> Result<Vec<extract::LayerBlob>, Error> {
    let manifest = layout_manifest(layout_dir)?;
    let blobs_dir = layout_dir.join("blobs/sha256");
    Ok(manifest
        .layers()
        .iter()
        .map(|desc| extract::LayerBlob {
            media_type: desc.media_type().clone(),
            path: blobs_dir.join(desc.digest().digest()),
        })
        .collect())
}

fn layout_manifest(layout_dir: &Path) -> Result<ImageManifest, Error> {
    let index = oci_spec::image::ImageIndex::from_file(layout_dir.join("index.json"))
        .context("Failed to read index.json")?;
    let descriptor = index
        .manifests()
        .first()
        .context("Image index lists no manifests")?;
    let manifest_path = layout_dir
        .join("blobs/sha256")
        .join(descriptor.digest().digest());
    ImageManifest::from_file(&manifest_path)
        .with_context(|| format!("Failed to read manifest '{}'", manifest_path.display()))
}

fn parse_reference(image_ref: &str) -> Result<Reference, Error> {
    Reference::try_from(image_ref)
        .with_context(|| format!("Failed to parse image reference '{image_ref}'"))
}

fn new_client() -> OciClient {
    let goarch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    OciClient::new(ClientConfig {
        platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
            entries
                .iter()
                .find(|entry| {
                    entry.platform.as_ref().is_some_and(|p| {
                        p.os == "linux" && p.architecture == goarch
                    })
                })
                .map(|entry| entry.digest.clone())
        })),
        ..Default::default()
    })
}

/// Writes a blob under its own sha256 and returns the typed digest.
fn write_blob(blobs_dir: &Path, data: &[u8]) -> Result<Sha256Digest, Error> {
    let digest = Digest::from_bytes(data);
    let path = blobs_dir.join(digest.hex());
    if !path.exists() {
        osutils::files::write_atomic(&path, data, 0o644)?;
    }
    digest
        .hex()
        .parse::<Sha256Digest>()
        .map_err(|e| anyhow::anyhow!("Failed to type blob digest: {e}"))
}

/// Counts the uncompressed bytes of every layer and captures the image's
/// os-release, letting later layers win.
fn scan_layers(layers: &[ImageLayer]) -> Result<(u64, OsRelease), Error> {
    let mut total = 0u64;
    let mut os_release = OsRelease::default();

    for layer in layers {
        let media_type = MediaType::from(layer.media_type.as_str());
        let reader = extract::decompress(&media_type, reopen(&layer.data)?)?;
        let mut counting = CountingReader { inner: reader, count: 0 };

        {
            let mut archive = tar::Archive::new(&mut counting);
            for entry in archive.entries().context("Failed to scan layer")? {
                let mut entry = entry.context("Failed to scan layer entry")?;
                let path = entry.path().context("Failed to decode entry path")?;
                let is_os_release = path == Path::new("usr/lib/os-release")
                    || path == Path::new("./usr/lib/os-release")
                    || path == Path::new("etc/os-release")
                    || path == Path::new("./etc/os-release");
                if is_os_release && entry.header().entry_type() == tar::EntryType::Regular {
                    let mut contents = String::new();
                    entry
                        .read_to_string(&mut contents)
                        .context("Failed to read os-release from layer")?;
                    trace!("Found os-release in layer");
                    os_release = OsRelease::parse(&contents);
                }
            }
        }

        // Drain whatever the tar reader left so the count covers the stream.
        std::io::copy(&mut counting, &mut std::io::sink())
            .context("Failed to drain layer stream")?;
        total += counting.count;
    }

    Ok((total, os_release))
}

/// `decompress` takes a `File`; spill the in-memory blob to a temp file so
/// the same dispatch serves both the pull path and the extract path.
fn reopen(data: &[u8]) -> Result<File, Error> {
    let mut tmp = tempfile::tempfile().context("Failed to create temporary file")?;
    use std::io::{Seek, Write};
    tmp.write_all(data).context("Failed to spool layer")?;
    tmp.seek(std::io::SeekFrom::Start(0))
        .context("Failed to rewind layer")?;
    Ok(tmp)
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_reader() {
        let data = vec![7u8; 1000];
        let mut reader = CountingReader {
            inner: std::io::Cursor::new(data),
            count: 0,
        };
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        assert_eq!(reader.count, 1000);
    }

    #[test]
    fn test_write_blob_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let digest = write_blob(dir.path(), b"payload").unwrap();
        let expected = Digest::from_bytes(b"payload");
        assert_eq!(digest.digest(), expected.hex());
        assert!(dir.path().join(expected.hex()).exists());
    }

    #[test]
    fn test_parse_reference() {
        parse_reference("ghcr.io/test/bootc:v1").unwrap();
    }
}
