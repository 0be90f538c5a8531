//! nbc installs and atomically updates an immutable, container-image-based
//! Linux system: fixed GPT layout with A/B root slots, optional LUKS2
//! encryption with TPM2 auto-unlock, a persistent /etc served by an
//! early-boot overlay, and a rollback-safe one-shot boot protocol for
//! updates.

pub mod assets;
pub mod bootdev;
pub mod bootloader;
pub mod cache;
pub mod cli;
pub mod datastore;
pub mod engine;
pub mod etcoverlay;
pub mod extract;
pub mod report;
pub mod storage;

pub const NBC_VERSION: &str = env!("CARGO_PKG_VERSION");
