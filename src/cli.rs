use std::path::PathBuf;

use clap::{Parser, Subcommand};

use nbc_api::config::{BootloaderType, FilesystemType};
use nbc_api::error::{InvalidInputError, NbcError, NbcResult};

#[derive(Parser, Debug)]
#[command(name = "nbc", version, about = "Install and update container-image-based systems")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit progress as JSON Lines on stdout.
    #[arg(global = true, long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install an image onto a block device.
    Install {
        /// Image reference, e.g. ghcr.io/org/os:stable.
        image: String,
        /// Target disk, e.g. /dev/nvme0n1.
        device: PathBuf,
        /// Filesystem for root and var: ext4 or btrfs.
        #[arg(long)]
        filesystem: Option<String>,
        /// Bootloader: grub2 or systemd-boot.
        #[arg(long)]
        bootloader: Option<String>,
        /// Extra kernel cmdline argument; may be repeated.
        #[arg(long = "karg")]
        kernel_args: Vec<String>,
        /// Encrypt root and var with LUKS2; the passphrase is read from
        /// this file.
        #[arg(long)]
        passphrase_file: Option<PathBuf>,
        /// Additionally enroll a TPM2 token for unattended unlock.
        #[arg(long, requires = "passphrase_file")]
        tpm2: bool,
        /// Install from the pre-staged cache instead of the network.
        #[arg(long)]
        staged: bool,
    },

    /// Stage an update onto the inactive slot.
    Update {
        /// Image reference; defaults to the installed one.
        #[arg(long)]
        image: Option<String>,
        /// Use the pre-staged update cache instead of the network.
        #[arg(long)]
        staged: bool,
    },

    /// Show the installed image, slots, and pending update.
    Status,

    /// Clear a staged update and restore the previous boot default.
    Rollback,

    /// Confirm a successful boot: promote the active slot to default.
    BootConfirm,

    /// Manage the image cache.
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Download an image into the cache.
    Download { image: String },
    /// List cached images.
    List,
    /// Remove one image by digest, unique prefix, or reference.
    Remove { key: String },
    /// Remove all cached images.
    Clear,
}

pub fn parse_filesystem(value: Option<&str>) -> NbcResult<FilesystemType> {
    match value {
        None => Ok(FilesystemType::default()),
        Some("ext4") => Ok(FilesystemType::Ext4),
        Some("btrfs") => Ok(FilesystemType::Btrfs),
        Some(other) => Err(NbcError::new(InvalidInputError::UnsupportedFilesystem {
            filesystem: other.to_owned(),
        })),
    }
}

pub fn parse_bootloader(value: Option<&str>) -> NbcResult<BootloaderType> {
    match value {
        None => Ok(BootloaderType::default()),
        Some("grub2") => Ok(BootloaderType::Grub2),
        Some("systemd-boot") => Ok(BootloaderType::SystemdBoot),
        Some(other) => Err(NbcError::new(InvalidInputError::UnsupportedBootloader {
            bootloader: other.to_owned(),
        })),
    }
}
