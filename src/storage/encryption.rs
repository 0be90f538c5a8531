//! LUKS2 lifecycle: format, open, TPM2 enrollment, crypttab, close.
//!
//! The LUKS UUID is the stable identity carried into crypttab, fstab, and
//! the kernel cmdline. Mapper names are stable across boots because
//! crypttab resolves them at boot time.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};
use uuid::Uuid;

use nbc_api::config::LuksVolumeRecord;
use nbc_api::error::{IoFailedError, NbcResult, ReportError};
use osutils::adapter::OsAdapter;
use osutils::cmd_args;
use osutils::dependencies::Dependency;

/// Passphrase spooled to a 0600 temp file, since cryptsetup and
/// systemd-cryptenroll take key material by path.
pub struct KeyFile {
    file: tempfile::NamedTempFile,
}

impl KeyFile {
    pub fn new(passphrase: &str) -> NbcResult<Self> {
        let mut file = tempfile::Builder::new()
            .permissions(std::fs::Permissions::from_mode(0o600))
            .tempfile()
            .context("Failed to create key file")
            .structured(IoFailedError::WriteFile {
                path: PathBuf::from("keyfile"),
            })?;
        file.write_all(passphrase.as_bytes())
            .context("Failed to write key file")
            .structured(IoFailedError::WriteFile {
                path: PathBuf::from("keyfile"),
            })?;
        Ok(KeyFile { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// An opened LUKS2 volume.
#[derive(Debug, Clone)]
pub struct LuksVolume {
    pub device: PathBuf,
    pub mapper: String,
    pub uuid: Uuid,
}

impl LuksVolume {
    pub fn mapper_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mapper/{}", self.mapper))
    }

    pub fn record(&self) -> LuksVolumeRecord {
        LuksVolumeRecord {
            mapper: self.mapper.clone(),
            luks_uuid: self.uuid,
        }
    }
}

pub struct LuksManager<'a> {
    adapter: &'a dyn OsAdapter,
}

impl<'a> LuksManager<'a> {
    pub fn new(adapter: &'a dyn OsAdapter) -> Self {
        LuksManager { adapter }
    }

    /// Formats `device` as LUKS2 with the argon2id KDF at default cost
    /// parameters.
    pub fn format(&self, device: &Path, key: &KeyFile) -> NbcResult<()> {
        info!("Formatting '{}' as LUKS2", device.display());
        self.adapter
            .run_checked(
                Dependency::Cryptsetup,
                &cmd_args![
                    "luksFormat",
                    "--type",
                    "luks2",
                    "--pbkdf",
                    "argon2id",
                    "--batch-mode",
                    "--key-file",
                    key.path(),
                    device
                ],
            )
            .structured(IoFailedError::LuksFormat {
                device: device.to_owned(),
            })
    }

    /// Opens `device` under a stable mapper name. A failed open is retried
    /// once after a udev settle; fresh mappers sometimes lose the race with
    /// device node creation.
    pub fn open(&self, device: &Path, mapper: &str, key: &KeyFile) -> NbcResult<LuksVolume> {
        let args = cmd_args![
            "luksOpen",
            "--key-file",
            key.path(),
            device,
            mapper
        ];
        if let Err(first) = self.adapter.run_checked(Dependency::Cryptsetup, &args) {
            warn!(
                "Failed to open '{}' as '{mapper}', settling udev and retrying: {first:#}",
                device.display()
            );
            self.adapter
                .run_checked(Dependency::Udevadm, &cmd_args!["settle"])
                .structured(IoFailedError::LuksOpen {
                    device: device.to_owned(),
                    mapper: mapper.to_owned(),
                })?;
            self.adapter
                .run_checked(Dependency::Cryptsetup, &args)
                .structured(IoFailedError::LuksOpen {
                    device: device.to_owned(),
                    mapper: mapper.to_owned(),
                })?;
        }

        let uuid = self.luks_uuid(device)?;
        Ok(LuksVolume {
            device: device.to_owned(),
            mapper: mapper.to_owned(),
            uuid,
        })
    }

    pub fn luks_uuid(&self, device: &Path) -> NbcResult<Uuid> {
        let output = self
            .adapter
            .run_output(Dependency::Cryptsetup, &cmd_args!["luksUUID", device])
            .structured(IoFailedError::LuksOpen {
                device: device.to_owned(),
                mapper: String::new(),
            })?;
        Uuid::parse_str(output.trim())
            .with_context(|| format!("cryptsetup returned an unusable UUID '{}'", output.trim()))
            .structured(IoFailedError::LuksOpen {
                device: device.to_owned(),
                mapper: String::new(),
            })
    }

    /// Binds a TPM2 token to the volume with an empty PCR policy, so
    /// auto-unlock survives kernel and firmware updates. A failure here is a
    /// hard error; the caller only asks when TPM2 was requested.
    pub fn enroll_tpm2(&self, device: &Path, key: &KeyFile) -> NbcResult<()> {
        info!("Enrolling TPM2 token on '{}'", device.display());
        self.adapter
            .run_checked(
                Dependency::SystemdCryptenroll,
                &cmd_args![
                    "--tpm2-device=auto",
                    "--tpm2-pcrs=",
                    format!("--unlock-key-file={}", key.path().display()),
                    device
                ],
            )
            .structured(IoFailedError::Tpm2Enroll {
                device: device.to_owned(),
            })
    }

    pub fn close(&self, mapper: &str) -> NbcResult<()> {
        debug!("Closing LUKS mapper '{mapper}'");
        self.adapter
            .run_checked(Dependency::Cryptsetup, &cmd_args!["luksClose", mapper])
            .structured(IoFailedError::LuksOpen {
                device: PathBuf::new(),
                mapper: mapper.to_owned(),
            })
    }

    pub fn close_best_effort(&self, mapper: &str) {
        if let Err(e) = self.close(mapper) {
            warn!("Failed to close mapper '{mapper}' during teardown: {e:?}");
        }
    }
}

/// One canonical crypttab line.
pub fn crypttab_line(volume: &LuksVolume, tpm2: bool) -> String {
    let mut options = String::from("luks,discard");
    if tpm2 {
        options.push_str(",tpm2-device=auto");
    }
    format!(
        "{}  UUID={}  none  {}",
        volume.mapper, volume.uuid, options
    )
}

/// Writes `etc/crypttab` under a target root.
pub fn write_crypttab(root: &Path, volumes: &[LuksVolume], tpm2: bool) -> NbcResult<()> {
    let contents = volumes
        .iter()
        .map(|v| crypttab_line(v, tpm2))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n";
    let path = osutils::path::join_relative(root, "/etc/crypttab");
    osutils::files::write_atomic(&path, contents, 0o600).structured(IoFailedError::WriteFile {
        path,
    })
}
