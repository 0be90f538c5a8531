use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::files;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another process holds the lock. Acquisition is non-blocking on
    /// purpose: install and update are interactive operations and waiting
    /// silently on a lock looks like a hang.
    #[error("Lock at '{0}' is held by another process")]
    Held(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An advisory whole-file flock. Held for the lifetime of the value;
/// releases on drop, including process exit.
#[derive(Debug)]
pub struct FileLock {
    _flock: Flock<std::fs::File>,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock at `path` without blocking, creating the lock file
    /// (and its parents) if needed.
    pub fn acquire(path: impl AsRef<Path>, mode: LockMode) -> Result<Self, LockError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            files::ensure_dir(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        match Flock::lock(file, arg) {
            Ok(flock) => {
                debug!("Acquired {mode:?} lock at '{}'", path.display());
                Ok(FileLock {
                    _flock: flock,
                    path: path.to_owned(),
                })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(LockError::Held(path.to_owned())),
            Err((_, errno)) => Err(LockError::Other(anyhow::Error::from(errno).context(
                format!("Failed to lock '{}'", path.display()),
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
