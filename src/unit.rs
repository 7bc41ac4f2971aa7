//! Work units and the processor collaborator that analyzes them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::task::TaskId;

/// The smallest individually reprocessable item inside a multi-unit step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    /// Opaque reference to the unit's content.
    #[serde(default)]
    pub content: serde_json::Value,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            content,
        }
    }
}

/// What a processor knows about the task a unit belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitContext {
    pub task_id: TaskId,
    pub owner_id: String,
    pub options: serde_json::Value,
}

/// A single work unit could not be processed.
#[derive(Error, Debug)]
#[error("unit {unit}: {cause:#}")]
pub struct ProcessingError {
    pub unit: String,
    pub cause: anyhow::Error,
    /// Transient failure - worth retrying.
    pub retryable: bool,
}

impl ProcessingError {
    pub fn retryable(unit: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            unit: unit.into(),
            cause: cause.into(),
            retryable: true,
        }
    }

    pub fn permanent(unit: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            unit: unit.into(),
            cause: cause.into(),
            retryable: false,
        }
    }

    pub fn timeout(unit: impl Into<String>, after: Duration) -> Self {
        Self::retryable(unit, anyhow::anyhow!("timed out after {after:?}"))
    }
}

/// What a multi-unit step does when one unit fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitFailurePolicy {
    /// Record the failure, leave the unit unanalyzed and move on.
    #[default]
    SkipAndContinue,
    /// Fail the step, and with it the task.
    AbortStep,
}

/// External service that turns one work unit into a result.
///
/// Calls may be slow and may fail; the engine bounds them with a timeout and
/// retries retryable failures.
#[async_trait]
pub trait WorkUnitProcessor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "processor"
    }

    async fn process(
        &self,
        unit: &WorkUnit,
        context: &UnitContext,
    ) -> Result<serde_json::Value, ProcessingError>;
}

#[async_trait]
impl<T: WorkUnitProcessor + ?Sized> WorkUnitProcessor for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn process(
        &self,
        unit: &WorkUnit,
        context: &UnitContext,
    ) -> Result<serde_json::Value, ProcessingError> {
        (**self).process(unit, context).await
    }
}

/// Tries a primary processor and, when it fails, a fallback provider.
pub struct FallbackProcessor<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackProcessor<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P, F> WorkUnitProcessor for FallbackProcessor<P, F>
where
    P: WorkUnitProcessor,
    F: WorkUnitProcessor,
{
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn process(
        &self,
        unit: &WorkUnit,
        context: &UnitContext,
    ) -> Result<serde_json::Value, ProcessingError> {
        match self.primary.process(unit, context).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    task_id = %context.task_id,
                    unit = %unit.id,
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "Primary processor failed, trying fallback"
                );
                self.fallback.process(unit, context).await
            }
        }
    }
}
