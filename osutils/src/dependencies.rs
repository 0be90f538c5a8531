use std::{path::PathBuf, process::Command};

use anyhow::{Context, Error};
use strum_macros::IntoStaticStr;

/// External tools nbc invokes. Resolution goes through $PATH via `which` so a
/// missing tool surfaces as a precondition failure before any disk is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Blkid,
    Bootctl,
    Chroot,
    Cryptsetup,
    Dracut,
    Lsblk,
    Lsinitrd,
    Lsinitramfs,
    Mkfs,
    Mount,
    Partprobe,
    Sgdisk,
    #[strum(serialize = "systemd-cryptenroll")]
    SystemdCryptenroll,
    Udevadm,
    Umount,
    Wipefs,
    #[strum(serialize = "grub2-editenv")]
    Grub2Editenv,
    #[strum(serialize = "grub2-install")]
    Grub2Install,
    // Test dependencies
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    pub fn path(&self) -> Result<PathBuf, Error> {
        which::which(self.name())
            .with_context(|| format!("Failed to find dependency '{}'", self.name()))
    }

    /// A `Command` preset to this tool.
    pub fn cmd(&self) -> Command {
        Command::new(self.name())
    }
}
