use std::ffi::OsString;

use anyhow::{ensure, Error};

use crate::dependencies::Dependency;
use crate::exe::RunAndCheck;

/// Capability seam for every subprocess that mutates host state (sgdisk,
/// mkfs, mount, cryptsetup, dracut, …). Production code uses [`HostAdapter`];
/// tests substitute a recording fake so install and update logic can be
/// exercised without a disk.
pub trait OsAdapter: Send + Sync {
    /// Run the tool to completion and fail on a non-zero exit.
    fn run_checked(&self, tool: Dependency, args: &[OsString]) -> Result<(), Error>;

    /// Run the tool and return its stdout, failing on a non-zero exit.
    fn run_output(&self, tool: Dependency, args: &[OsString]) -> Result<String, Error>;

    /// Fail unless the tool resolves in $PATH.
    fn check_available(&self, tool: Dependency) -> Result<(), Error> {
        ensure!(
            tool.exists(),
            "Required tool '{}' was not found in PATH",
            tool.name()
        );
        Ok(())
    }
}

/// Executes tools on the host through [`RunAndCheck`].
#[derive(Debug, Default)]
pub struct HostAdapter;

impl OsAdapter for HostAdapter {
    fn run_checked(&self, tool: Dependency, args: &[OsString]) -> Result<(), Error> {
        tool.cmd().args(args).run_and_check()
    }

    fn run_output(&self, tool: Dependency, args: &[OsString]) -> Result<String, Error> {
        tool.cmd().args(args).output_and_check()
    }
}

/// Convenience for building adapter argument vectors from mixed types.
#[macro_export]
macro_rules! cmd_args {
    ($($arg:expr),* $(,)?) => {
        vec![$(::std::ffi::OsString::from($arg)),*]
    };
}
