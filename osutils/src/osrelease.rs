use std::path::Path;

use anyhow::{Context, Error};

use crate::path::join_relative;

/// Path of the os-release file relative to a root, per `os-release(5)`.
/// The /etc location is a symlink to this one on the systems nbc manages.
pub const OS_RELEASE_PATH: &str = "/usr/lib/os-release";

/// The subset of os-release fields nbc records in image metadata.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct OsRelease {
    pub id: Option<String>,
    pub pretty_name: Option<String>,
    pub version_id: Option<String>,
}

impl OsRelease {
    /// Reads `usr/lib/os-release` under the given root.
    pub fn read_root(root: impl AsRef<Path>) -> Result<Self, Error> {
        let path = join_relative(root, OS_RELEASE_PATH);
        Ok(Self::parse(&std::fs::read_to_string(&path).with_context(
            || format!("Failed to read '{}'", path.display()),
        )?))
    }

    /// Parses the `KEY=value` format, stripping surrounding quotes.
    pub fn parse(contents: &str) -> Self {
        let mut release = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.trim() {
                "ID" => release.id = Some(value.to_owned()),
                "PRETTY_NAME" => release.pretty_name = Some(value.to_owned()),
                "VERSION_ID" => release.version_id = Some(value.to_owned()),
                _ => {}
            }
        }
        release
    }
}
