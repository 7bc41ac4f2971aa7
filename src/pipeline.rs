//! The contract a task type implements to run under the engine.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::CheckpointData;
use crate::context::StepContext;
use crate::step::{StepError, StepName, StepTable};

/// A task type: a step table plus the executor for each of its steps.
///
/// The engine persists progress between steps, so `execute` must leave the
/// task's intermediate data consistent whenever it returns, and must be
/// idempotent over the data a previous, interrupted run left behind.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait]
/// impl TaskPipeline for Export {
///     type Step = ExportStep;
///     type Params = ExportParams;
///     type Data = ExportData;
///
///     fn task_type(&self) -> &'static str { "export" }
///     fn steps(&self) -> &StepTable<ExportStep> { &self.steps }
///
///     async fn execute(
///         &self,
///         step: ExportStep,
///         ctx: &mut StepContext<'_, ExportParams, ExportData>,
///     ) -> Result<(), StepError> {
///         match step {
///             ExportStep::Collect => self.collect(ctx).await,
///             ExportStep::Write => self.write(ctx).await,
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait TaskPipeline: Send + Sync + 'static {
    type Step: StepName;
    type Params: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Data: CheckpointData;

    /// Name under which tasks of this type are created.
    fn task_type(&self) -> &'static str;

    fn steps(&self) -> &StepTable<Self::Step>;

    /// Reject parameters before a task is created.
    fn validate(&self, _params: &Self::Params) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run one step.
    async fn execute(
        &self,
        step: Self::Step,
        ctx: &mut StepContext<'_, Self::Params, Self::Data>,
    ) -> Result<(), StepError>;
}
