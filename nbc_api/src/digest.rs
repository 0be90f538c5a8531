use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ErrorKind, InvalidInputError, NbcError};

/// Canonical manifest digest of a container image, `sha256:<64 hex chars>`.
///
/// The cache stores each image under a directory named after its digest with
/// the first `:` replaced by `-`, since `:` is awkward in path components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

const SHA256_PREFIX: &str = "sha256:";

impl Digest {
    /// Validates and wraps a full digest string.
    pub fn parse(s: &str) -> Result<Self, NbcError> {
        let hex = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| invalid(s))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid(s));
        }
        // Normalize to lowercase so directory names are stable.
        Ok(Digest(format!("{SHA256_PREFIX}{}", hex.to_ascii_lowercase())))
    }

    /// Computes the digest of a byte buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest as _, Sha256};
        let hash = Sha256::digest(data);
        Digest(format!("{SHA256_PREFIX}{:x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion without the `sha256:` prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    /// Abbreviated form for log lines, `sha256:abcdef123456…`.
    pub fn short(&self) -> String {
        format!("{SHA256_PREFIX}{}", &self.hex()[..12])
    }

    /// Cache directory name: the first (and only) `:` becomes `-`.
    pub fn to_dir_name(&self) -> String {
        self.0.replacen(':', "-", 1)
    }

    /// Inverse of [`Digest::to_dir_name`].
    pub fn from_dir_name(dir: &str) -> Result<Self, NbcError> {
        Self::parse(&dir.replacen('-', ":", 1))
    }
}

fn invalid(digest: &str) -> NbcError {
    NbcError::new(ErrorKind::InvalidInput(InvalidInputError::InvalidDigest {
        digest: digest.to_owned(),
    }))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = NbcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(&s), &"sha256:<64 hex>")
        })
    }
}
