use std::{
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use anyhow::{anyhow, bail, Context, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension over `std::process::Output` to check the exit status and turn
/// failures into errors carrying the captured output. Sealed.
pub trait OutputChecker: Sealed {
    fn is_success(&self) -> bool;
    fn exit_code(&self) -> Option<i32>;
    fn end_signal(&self) -> Option<i32>;

    /// Captured stdout.
    fn stdout_string(&self) -> String {
        "".into()
    }

    /// Captured stderr.
    fn stderr_string(&self) -> String {
        "".into()
    }

    /// All captured output, for reporting.
    fn output_report(&self) -> String {
        let stdout = self.stdout_string();
        let stderr = self.stderr_string();

        let mut report = String::with_capacity(stdout.len() + stderr.len() + 20);
        if !stdout.is_empty() {
            report += &format!("stdout:\n{}\n", stdout);
        }
        if !stderr.is_empty() {
            if !report.is_empty() {
                report += "\n";
            }
            report += &format!("stderr:\n{}\n", stderr);
        }
        report
    }

    fn explain_exit(&self) -> String {
        if let Some(code) = self.exit_code() {
            format!("process exited with status: {code}")
        } else if let Some(signal) = self.end_signal() {
            format!("process was terminated by signal: {signal}")
        } else {
            "process exited with unknown status".into()
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }

        Err(match self.output_report() {
            s if !s.is_empty() => anyhow!("Process output:\n{}", s).context(self.explain_exit()),
            _ => anyhow!("(No output was captured)").context(self.explain_exit()),
        })
    }

    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.stdout_string())
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn end_signal(&self) -> Option<i32> {
        self.status.signal()
    }

    fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
}

impl Sealed for Result<Output, std::io::Error> {}

impl OutputChecker for Result<Output, std::io::Error> {
    fn is_success(&self) -> bool {
        self.as_ref().map(|o| o.is_success()).unwrap_or(false)
    }

    fn exit_code(&self) -> Option<i32> {
        self.as_ref().ok().and_then(|o| o.exit_code())
    }

    fn end_signal(&self) -> Option<i32> {
        self.as_ref().ok().and_then(|o| o.end_signal())
    }

    fn stdout_string(&self) -> String {
        self.as_ref().map(|o| o.stdout_string()).unwrap_or_default()
    }

    fn stderr_string(&self) -> String {
        self.as_ref().map(|o| o.stderr_string()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), Error> {
        match self {
            Ok(output) => output.check(),
            Err(e) => bail!("Failed to execute process: {}", e),
        }
    }

    fn check_output(&self) -> Result<String, Error> {
        match self {
            Ok(output) => output.check_output(),
            Err(e) => bail!("Failed to execute process: {}", e),
        }
    }
}

/// Run a command to completion, check its exit status, and surface its output
/// in errors. Sealed; implemented for `std::process::Command`.
pub trait RunAndCheck: Sealed {
    fn run_and_check(&mut self) -> Result<(), Error>;
    fn output_and_check(&mut self) -> Result<String, Error>;
    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output();
        trace!(
            "Executed '{rendered}': {}. Report:\n{}",
            result.explain_exit(),
            result.output_report(),
        );
        result
            .check()
            .with_context(|| format!("Error when running: {rendered}"))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output();
        trace!(
            "Executed '{rendered}': {}. Report:\n{}",
            result.explain_exit(),
            result.output_report(),
        );
        result
            .check_output()
            .with_context(|| format!("Error when running: {rendered}"))
    }

    fn render_command(&self) -> String {
        if self.get_args().count() == 0 {
            self.get_program().to_string_lossy().into()
        } else {
            format!(
                "{} {}",
                self.get_program().to_string_lossy(),
                self.get_args()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            )
        }
    }
}
