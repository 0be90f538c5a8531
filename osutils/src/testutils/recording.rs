use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::Mutex;

use anyhow::{bail, Error};

use crate::adapter::OsAdapter;
use crate::dependencies::Dependency;

/// Test double for [`OsAdapter`]: records every invocation as a rendered
/// command line and replays canned stdout for `run_output` calls.
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    invocations: Mutex<Vec<String>>,
    canned: Mutex<HashMap<&'static str, VecDeque<String>>>,
    fail_on: Mutex<Vec<&'static str>>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue stdout to return from the next `run_output` call of `tool`.
    pub fn push_output(&self, tool: Dependency, stdout: impl Into<String>) {
        self.canned
            .lock()
            .unwrap()
            .entry(tool.name())
            .or_default()
            .push_back(stdout.into());
    }

    /// Make every call of `tool` fail.
    pub fn fail_tool(&self, tool: Dependency) {
        self.fail_on.lock().unwrap().push(tool.name());
    }

    /// All invocations so far, rendered as `tool arg1 arg2 …`.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// Whether any recorded invocation contains `needle`.
    pub fn invoked(&self, needle: &str) -> bool {
        self.invocations().iter().any(|line| line.contains(needle))
    }

    fn record(&self, tool: Dependency, args: &[OsString]) -> Result<(), Error> {
        let mut line = tool.name().to_owned();
        for arg in args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        self.invocations.lock().unwrap().push(line);

        if self.fail_on.lock().unwrap().contains(&tool.name()) {
            bail!("{} failed (injected)", tool.name());
        }
        Ok(())
    }
}

impl OsAdapter for RecordingAdapter {
    fn run_checked(&self, tool: Dependency, args: &[OsString]) -> Result<(), Error> {
        self.record(tool, args)
    }

    fn run_output(&self, tool: Dependency, args: &[OsString]) -> Result<String, Error> {
        self.record(tool, args)?;
        Ok(self
            .canned
            .lock()
            .unwrap()
            .get_mut(tool.name())
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default())
    }

    fn check_available(&self, _tool: Dependency) -> Result<(), Error> {
        Ok(())
    }
}
