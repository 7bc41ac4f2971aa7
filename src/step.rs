//! Step tables and step error types.

use std::fmt;
use thiserror::Error;

use crate::runner::TaskError;

/// The closed set of step names of one task type.
///
/// Implemented by a plain enum so that step dispatch is an exhaustive
/// `match` rather than a string switch.
pub trait StepName: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// The name persisted in `completed_steps` and sent in events.
    fn as_str(&self) -> &'static str;
}

/// Why a step stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Paused,
    Cancelled,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Paused => f.write_str("paused"),
            Interrupt::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Error returned by a step execution.
#[derive(Error, Debug)]
pub enum StepError {
    /// The step cannot complete. The task fails and keeps its checkpoint.
    #[error("{0:#}")]
    Failed(#[source] anyhow::Error),

    /// The task was paused or cancelled while the step was running.
    #[error("task {0}")]
    Interrupted(Interrupt),

    /// Reading or writing the task record failed.
    #[error(transparent)]
    Store(#[from] TaskError),
}

impl StepError {
    /// Create a step failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    /// Returns the interruption, if this error is one.
    pub fn interrupt(&self) -> Option<Interrupt> {
        match self {
            Self::Interrupted(interrupt) => Some(*interrupt),
            _ => None,
        }
    }
}

/// One row of a step table.
#[derive(Debug, Clone, Copy)]
pub struct StepSpec<S> {
    pub step: S,
    /// Progress percentage reported when the step starts.
    pub progress: u8,
    /// Human-readable message sent with the step's progress event.
    pub message: &'static str,
}

impl<S: StepName> StepSpec<S> {
    pub fn new(step: S, progress: u8, message: &'static str) -> Self {
        Self {
            step,
            progress,
            message,
        }
    }

    pub fn name(&self) -> &'static str {
        self.step.as_str()
    }
}

/// The ordered steps shared by every task of a task type.
#[derive(Debug, Clone)]
pub struct StepTable<S> {
    steps: Vec<StepSpec<S>>,
}

impl<S: StepName> StepTable<S> {
    /// Build a table from steps in execution order.
    ///
    /// # Panics
    ///
    /// Panics if the table is empty, names a step twice, or its progress
    /// weights exceed 100 or decrease along the table.
    pub fn new(steps: Vec<StepSpec<S>>) -> Self {
        assert!(!steps.is_empty(), "step table must not be empty");

        for (index, spec) in steps.iter().enumerate() {
            assert!(
                spec.progress <= 100,
                "step '{}' has progress {} above 100",
                spec.name(),
                spec.progress
            );
            assert!(
                !steps[..index].iter().any(|prev| prev.step == spec.step),
                "step '{}' appears twice",
                spec.name()
            );
            if let Some(prev) = index.checked_sub(1).map(|i| &steps[i]) {
                assert!(
                    prev.progress <= spec.progress,
                    "step '{}' progress {} is below '{}' progress {}",
                    spec.name(),
                    spec.progress,
                    prev.name(),
                    prev.progress
                );
            }
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[StepSpec<S>] {
        &self.steps
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(StepSpec::name).collect()
    }

    /// Progress at which the step at `index` hands over to the next one.
    pub fn end_progress(&self, index: usize) -> u8 {
        self.steps.get(index + 1).map_or(100, |next| next.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Demo {
        One,
        Two,
    }

    impl StepName for Demo {
        fn as_str(&self) -> &'static str {
            match self {
                Demo::One => "one",
                Demo::Two => "two",
            }
        }
    }

    #[test]
    fn test_end_progress_uses_next_step() {
        let table = StepTable::new(vec![
            StepSpec::new(Demo::One, 10, "first"),
            StepSpec::new(Demo::Two, 60, "second"),
        ]);
        assert_eq!(table.end_progress(0), 60);
        assert_eq!(table.end_progress(1), 100);
        assert_eq!(table.names(), vec!["one", "two"]);
    }

    #[test]
    #[should_panic(expected = "appears twice")]
    fn test_duplicate_step_rejected() {
        StepTable::new(vec![
            StepSpec::new(Demo::One, 10, "first"),
            StepSpec::new(Demo::One, 20, "again"),
        ]);
    }

    #[test]
    #[should_panic(expected = "is below")]
    fn test_decreasing_progress_rejected() {
        StepTable::new(vec![
            StepSpec::new(Demo::One, 50, "first"),
            StepSpec::new(Demo::Two, 20, "second"),
        ]);
    }

    #[test]
    fn test_failed_error_keeps_cause_chain() {
        let err = StepError::failed(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "outer: inner");
        assert_eq!(err.interrupt(), None);
        assert_eq!(
            StepError::Interrupted(Interrupt::Paused).to_string(),
            "task paused"
        );
    }
}
