//! The named-step workflow engine driving install and update.

pub mod install;
pub mod rollback;
pub mod update;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nbc_api::error::{CancelledError, NbcError, NbcResult, NbcResultExt};

use crate::report::Reporter;

/// Cooperative cancellation. Checked before every step and before every
/// destructive subprocess a step issues.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Typed error when cancellation was requested.
    pub fn check(&self) -> NbcResult<()> {
        if self.is_cancelled() {
            Err(NbcError::new(CancelledError::Cancelled))
        } else {
            Ok(())
        }
    }
}

type StepFn<'a, S> = Box<dyn FnOnce(&mut S) -> NbcResult<()> + 'a>;

/// An ordered sequence of named steps sharing one mutable state value.
/// Step errors are wrapped with the step name; cancellation is checked
/// before each step runs.
pub struct Workflow<'a, S> {
    reporter: &'a dyn Reporter,
    token: CancelToken,
    steps: Vec<(&'static str, StepFn<'a, S>)>,
}

impl<'a, S> Workflow<'a, S> {
    pub fn new(reporter: &'a dyn Reporter, token: CancelToken) -> Self {
        Workflow {
            reporter,
            token,
            steps: Vec::new(),
        }
    }

    pub fn step(
        mut self,
        name: &'static str,
        f: impl FnOnce(&mut S) -> NbcResult<()> + 'a,
    ) -> Self {
        self.steps.push((name, Box::new(f)));
        self
    }

    pub fn run(self, state: &mut S) -> NbcResult<()> {
        let total = self.steps.len();
        for (index, (name, step)) in self.steps.into_iter().enumerate() {
            self.token.check()?;
            self.reporter.step(index + 1, total, name);
            step(state).message(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::NullReporter;
    use nbc_api::error::{ErrorKind, IoFailedError};

    #[test]
    fn test_steps_run_in_order() {
        let mut log: Vec<&str> = Vec::new();
        Workflow::new(&NullReporter, CancelToken::new())
            .step("one", |log: &mut Vec<&str>| {
                log.push("one");
                Ok(())
            })
            .step("two", |log: &mut Vec<&str>| {
                log.push("two");
                Ok(())
            })
            .run(&mut log)
            .unwrap();
        assert_eq!(log, vec!["one", "two"]);
    }

    #[test]
    fn test_precancelled_runs_nothing() {
        let token = CancelToken::new();
        token.cancel();

        let mut ran = false;
        let err = Workflow::new(&NullReporter, token)
            .step("never", |ran: &mut bool| {
                *ran = true;
                Ok(())
            })
            .run(&mut ran)
            .unwrap_err();

        assert!(!ran);
        assert!(matches!(err.kind(), ErrorKind::Cancelled(_)));
    }

    #[test]
    fn test_error_wrapped_with_step_name() {
        let err = Workflow::new(&NullReporter, CancelToken::new())
            .step("Format disks", |_: &mut ()| {
                Err(NbcError::new(IoFailedError::Format {
                    device: "/dev/sda2".into(),
                }))
            })
            .run(&mut ())
            .unwrap_err();

        let rendered = err.to_string();
        assert!(rendered.contains("Format disks"), "got: {rendered}");
        assert!(rendered.contains("Failed to format"), "got: {rendered}");
    }

    #[test]
    fn test_error_stops_workflow() {
        let mut count = 0;
        let _ = Workflow::new(&NullReporter, CancelToken::new())
            .step("first", |count: &mut i32| {
                *count += 1;
                Err(NbcError::new(IoFailedError::CacheWrite))
            })
            .step("second", |count: &mut i32| {
                *count += 1;
                Ok(())
            })
            .run(&mut count)
            .unwrap_err();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_cancel_between_steps() {
        let token = CancelToken::new();
        let mut state = (token.clone(), 0u32);
        let err = Workflow::new(&NullReporter, token.clone())
            .step("first", |(token, count): &mut (CancelToken, u32)| {
                *count += 1;
                token.cancel();
                Ok(())
            })
            .step("second", |(_, count): &mut (CancelToken, u32)| {
                *count += 1;
                Ok(())
            })
            .run(&mut state)
            .unwrap_err();

        assert_eq!(state.1, 1);
        assert!(matches!(err.kind(), ErrorKind::Cancelled(_)));
    }
}
