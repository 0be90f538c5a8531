use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Error};

/// Creates a directory and all missing parents.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory '{}'", path.display()))
}

/// Reads a small text file (a passphrase, a marker) and strips surrounding
/// whitespace.
pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String, Error> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    Ok(contents.trim().to_owned())
}

/// Writes a file atomically with the given mode, creating parent
/// directories as needed: the content lands in a temporary file in the same
/// directory, which is renamed over the destination. Readers never see a
/// partial write.
pub fn write_atomic(
    path: impl AsRef<Path>,
    contents: impl AsRef<[u8]>,
    mode: u32,
) -> Result<(), Error> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .with_context(|| format!("Path '{}' has no parent directory", path.display()))?;
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).with_context(|| {
        format!("Failed to create temporary file in '{}'", parent.display())
    })?;
    tmp.write_all(contents.as_ref())
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .context("Failed to set file mode")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_read_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "  hunter2 \n").unwrap();
        assert_eq!(read_trimmed(&path).unwrap(), "hunter2");
        read_trimmed(dir.path().join("absent")).unwrap_err();
    }

    #[test]
    fn test_write_atomic_replaces_and_makes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loader/entries/entry.conf");
        write_atomic(&path, "first", 0o644).unwrap();
        write_atomic(&path, "second", 0o644).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
