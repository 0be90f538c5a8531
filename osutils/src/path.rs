use std::path::{Path, PathBuf};

/// Joins an absolute path under a root, e.g. `/mnt` + `/etc/crypttab` →
/// `/mnt/etc/crypttab`.
pub fn join_relative(root: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let relative = match path.as_ref().strip_prefix("/") {
        Ok(relative) => relative,
        Err(_) => path.as_ref(),
    };
    root.as_ref().join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        assert_eq!(
            join_relative("/mnt", "/etc/crypttab"),
            Path::new("/mnt/etc/crypttab")
        );
        assert_eq!(join_relative("/mnt", "etc"), Path::new("/mnt/etc"));
        assert_eq!(join_relative("/", "/etc"), Path::new("/etc"));
    }
}
