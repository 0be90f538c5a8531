//! Persistence of the [`SystemConfig`] record.
//!
//! One JSON file, world-readable, written atomically and verified by
//! reading back before success is reported. Legacy locations from earlier
//! layouts are honored on read and deleted after the next successful write.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};

use nbc_api::config::SystemConfig;
use nbc_api::constants::{CONFIG_PATH, LEGACY_CONFIG_PATHS};
use nbc_api::error::{
    IoFailedError, NbcError, NbcResult, NotFoundError, ReportError, VerificationFailedError,
};

pub struct ConfigStore {
    path: PathBuf,
    legacy_paths: Vec<PathBuf>,
}

impl ConfigStore {
    pub fn system() -> Self {
        ConfigStore {
            path: PathBuf::from(CONFIG_PATH),
            legacy_paths: LEGACY_CONFIG_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn at(path: impl Into<PathBuf>, legacy_paths: Vec<PathBuf>) -> Self {
        ConfigStore {
            path: path.into(),
            legacy_paths,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file() || self.legacy_paths.iter().any(|p| p.is_file())
    }

    /// Loads the record, falling back to legacy locations.
    pub fn load(&self) -> NbcResult<SystemConfig> {
        for (index, path) in std::iter::once(&self.path)
            .chain(self.legacy_paths.iter())
            .enumerate()
        {
            if !path.is_file() {
                continue;
            }
            if index > 0 {
                warn!(
                    "Reading system configuration from legacy location '{}'",
                    path.display()
                );
            }
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read '{}'", path.display()))
                .structured(IoFailedError::Read { path: path.clone() })?;
            return serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse '{}'", path.display()))
                .structured(IoFailedError::Read { path: path.clone() });
        }
        Err(NbcError::new(NotFoundError::Config {
            path: self.path.clone(),
        }))
    }

    /// Persists the record and verifies the write round-trips. Legacy files
    /// are deleted once the primary location holds a good copy.
    pub fn save(&self, config: &SystemConfig) -> NbcResult<()> {
        let contents = serde_json::to_string_pretty(config)
            .context("Failed to serialize system configuration")
            .structured(IoFailedError::WriteConfig {
                path: self.path.clone(),
            })?;
        osutils::files::write_atomic(&self.path, &contents, 0o644).structured(
            IoFailedError::WriteConfig {
                path: self.path.clone(),
            },
        )?;

        let reread = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to re-read '{}'", self.path.display()))
            .structured(IoFailedError::WriteConfig {
                path: self.path.clone(),
            })?;
        let parsed: SystemConfig = serde_json::from_str(&reread)
            .map_err(anyhow::Error::from)
            .structured(VerificationFailedError::ConfigRoundTrip)?;
        if &parsed != config {
            return Err(NbcError::new(VerificationFailedError::ConfigRoundTrip));
        }

        for legacy in &self.legacy_paths {
            if legacy.is_file() {
                match std::fs::remove_file(legacy) {
                    Ok(()) => debug!("Removed legacy config at '{}'", legacy.display()),
                    Err(e) => warn!(
                        "Failed to remove legacy config at '{}': {e}",
                        legacy.display()
                    ),
                }
            }
        }

        info!("Persisted system configuration to '{}'", self.path.display());
        Ok(())
    }
}
