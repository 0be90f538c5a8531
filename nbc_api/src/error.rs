use std::fmt::{Debug, Write};
use std::path::PathBuf;
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// A precondition for the requested operation does not hold on this host.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PreconditionFailedError {
    #[error("Required tool '{binary}' was not found in PATH")]
    MissingBinary { binary: String },
    #[error("'{path}' is not a block device")]
    NotBlockDevice { path: PathBuf },
    #[error("Selected operation requires root privileges")]
    MissingRequiredPermissions,
    #[error("Target disk '{path}' already hosts an installation; refusing to reinstall")]
    AlreadyInstalled { path: PathBuf },
    #[error("System is not managed by nbc (no marker at '{marker}')")]
    NotManagedSystem { marker: PathBuf },
    #[error("A staged update is already pending reboot")]
    UpdatePendingReboot,
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("'{digest}' is not a valid sha256 digest")]
    InvalidDigest { digest: String },
    #[error("Failed to parse image reference '{image}'")]
    InvalidImageReference { image: String },
    #[error("Unsupported filesystem '{filesystem}' (expected ext4 or btrfs)")]
    UnsupportedFilesystem { filesystem: String },
    #[error("Unsupported bootloader '{bootloader}' (expected grub2 or systemd-boot)")]
    UnsupportedBootloader { bootloader: String },
    #[error("Cannot derive a parent disk from '{device}'")]
    UnrecognizedDeviceName { device: String },
    #[error("Encryption was requested without a passphrase")]
    MissingPassphrase,
}

/// A referenced object does not exist.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum NotFoundError {
    #[error("Image '{reference}' was not found in the cache")]
    Image { reference: String },
    #[error("No partition labeled '{label}' on '{device}'")]
    Partition { label: String, device: PathBuf },
    #[error("No system configuration found at '{path}'")]
    Config { path: PathBuf },
    #[error("No kernel image found under '{root}'")]
    Kernel { root: PathBuf },
    #[error("Kernel cmdline has no root= argument")]
    RootCmdlineArgument,
    #[error("Device '{path}' does not exist")]
    Device { path: PathBuf },
}

/// An interaction with the OS (subprocess, filesystem, network) failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum IoFailedError {
    #[error("Failed to create partitions on '{device}'")]
    CreatePartitions { device: PathBuf },
    #[error("Failed to format '{device}'")]
    Format { device: PathBuf },
    #[error("Failed to mount '{device}' at '{target}'")]
    Mount { device: PathBuf, target: PathBuf },
    #[error("Failed to format LUKS2 volume on '{device}'")]
    LuksFormat { device: PathBuf },
    #[error("Failed to open LUKS2 volume '{device}' as '{mapper}'")]
    LuksOpen { device: PathBuf, mapper: String },
    #[error("Failed to enroll TPM2 token on '{device}'")]
    Tpm2Enroll { device: PathBuf },
    #[error("Failed to download image '{reference}'")]
    Download { reference: String },
    #[error("Failed to write image to cache")]
    CacheWrite,
    #[error("Failed to extract image layer {layer}")]
    ExtractLayer { layer: usize },
    #[error("Failed to populate '{path}'")]
    PopulateTree { path: PathBuf },
    #[error("Failed to write boot entries")]
    WriteBootEntries,
    #[error("Failed to regenerate the initramfs")]
    RegenerateInitramfs,
    #[error("Failed to persist system configuration to '{path}'")]
    WriteConfig { path: PathBuf },
    #[error("Failed to read '{path}'")]
    Read { path: PathBuf },
    #[error("Failed to write '{path}'")]
    WriteFile { path: PathBuf },
}

/// A produced artifact failed its own validation.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationFailedError {
    #[error("Extracted root is too small ({size} bytes, expected at least {minimum})")]
    RootTooSmall { size: u64, minimum: u64 },
    #[error("Extracted root is missing required directory '{dir}'")]
    MissingDirectory { dir: String },
    #[error("Extracted root has no readable usr/lib/os-release")]
    MissingOsRelease,
    #[error("Persisted configuration did not round-trip")]
    ConfigRoundTrip,
    #[error("Image digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("Entry '{path}' escapes the extraction root")]
    PathEscape { path: PathBuf },
}

/// The operation was cancelled before completion.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CancelledError {
    #[error("Operation was cancelled")]
    Cancelled,
}

/// Another process holds a required lock.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LockHeldError {
    #[error("Another nbc operation is in progress (system lock at '{path}' is held)")]
    System { path: PathBuf },
    #[error("The image cache is in use by another process (lock at '{path}' is held)")]
    Cache { path: PathBuf },
}

/// An identifier matched more than one object.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguousError {
    #[error("Digest prefix '{prefix}' matches {matches} cached images")]
    DigestPrefix { prefix: String, matches: usize },
    #[error("Expected at most one staged image, found {count}")]
    MultipleStagedImages { count: usize },
}

/// Each variant of `ErrorKind` corresponds to a category of error. The
/// categories are user-meaningful and map one-to-one onto process exit codes.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    PreconditionFailed(#[from] PreconditionFailedError),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    IoFailed(#[from] IoFailedError),

    #[error(transparent)]
    VerificationFailed(#[from] VerificationFailedError),

    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error(transparent)]
    LockHeld(#[from] LockHeldError),

    #[error(transparent)]
    Ambiguous(#[from] AmbiguousError),
}

impl ErrorKind {
    /// Stable process exit code for this category.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::PreconditionFailed(_) => 2,
            ErrorKind::InvalidInput(_) => 3,
            ErrorKind::NotFound(_) => 4,
            ErrorKind::IoFailed(_) => 5,
            ErrorKind::VerificationFailed(_) => 6,
            ErrorKind::Cancelled(_) => 7,
            ErrorKind::LockHeld(_) => 8,
            ErrorKind::Ambiguous(_) => 9,
        }
    }
}

#[derive(Debug)]
struct NbcErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct NbcError(Box<NbcErrorInner>);

impl NbcError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        NbcError(Box::new(NbcErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        NbcError(Box::new(NbcErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    pub fn exit_code(&self) -> u8 {
        self.0.kind.exit_code()
    }

    /// Flatten into an unstructured error, keeping the full chain.
    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }
}

pub type NbcResult<T> = Result<T, NbcError>;

pub trait ReportError<T, K> {
    /// Convert this error into a structured NbcError.
    fn structured(self, kind: K) -> Result<T, NbcError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NbcError> {
        match self {
            Some(t) => Ok(t),
            None => Err(NbcError(Box::new(NbcErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: None,
                context: Vec::new(),
            }))),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NbcError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(NbcError(Box::new(NbcErrorInner {
                kind: kind.into(),
                location: Location::caller(),
                source: Some(e.into()),
                context: Vec::new(),
            }))),
        }
    }
}

pub trait NbcResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, NbcError>;
}

impl<T> NbcResultExt<T> for Result<T, NbcError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, NbcError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

impl Serialize for NbcError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("nbc-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::PreconditionFailed(ref e) => state.serialize_field("error", e)?,
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::NotFound(ref e) => state.serialize_field("error", e)?,
            ErrorKind::IoFailed(ref e) => state.serialize_field("error", e)?,
            ErrorKind::VerificationFailed(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Cancelled(ref e) => state.serialize_field("error", e)?,
            ErrorKind::LockHeld(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Ambiguous(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for NbcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for NbcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)?;
        for (context, _) in self.0.context.iter().rev() {
            write!(f, ": {}", context)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_json::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = NbcError::with_source(
            IoFailedError::CacheWrite,
            std::fs::read("/non-existent-file")
                .context("failed to read file")
                .unwrap_err(),
        );
        match serde_json::to_value(&e).unwrap() {
            Value::Object(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["error"], Value::String("cache-write".into()));
                assert_eq!(m["category"], Value::String("io-failed".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String("Failed to write image to cache".into())
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't object"),
        }
    }

    #[test]
    fn test_error_debug_chain() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(CancelledError::Cancelled)
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Operation was cancelled at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_message_appears_in_display() {
        let error = Err::<(), _>(NbcError::new(IoFailedError::WriteBootEntries))
            .message("Format disks")
            .unwrap_err();
        let rendered = error.to_string();
        assert!(rendered.contains("Format disks"));
        assert!(rendered.contains("Failed to write boot entries"));
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(NbcError::new(CancelledError::Cancelled).exit_code(), 7);
        assert_eq!(
            NbcError::new(LockHeldError::System {
                path: "/var/run/nbc/system.lock".into()
            })
            .exit_code(),
            8
        );
        assert_eq!(
            NbcError::new(AmbiguousError::DigestPrefix {
                prefix: "sha256:abc123".into(),
                matches: 2
            })
            .exit_code(),
            9
        );
    }
}
