//! Type-erased pipeline wrapper for runtime dispatch.

use async_trait::async_trait;

use super::control::{self, RunOutcome};
use super::store::{TaskError, TaskStore};
use crate::broadcast::EventSink;
use crate::pipeline::TaskPipeline;
use crate::task::TaskId;

/// Type-erased pipeline that can be stored in a registry.
#[async_trait]
pub trait ErasedPipeline: Send + Sync {
    /// The task type this pipeline runs.
    fn task_type(&self) -> &'static str;

    /// Step names in execution order.
    fn step_names(&self) -> Vec<&'static str>;

    /// Check JSON parameters against the pipeline's typed parameters.
    fn validate_erased(&self, parameters: &serde_json::Value) -> Result<(), TaskError>;

    /// Run the control loop of a task until it completes, fails or stops.
    async fn run_erased(
        &self,
        task_id: TaskId,
        store: &dyn TaskStore,
        events: &EventSink,
    ) -> RunOutcome;
}

/// Wrapper that implements ErasedPipeline for a concrete TaskPipeline.
pub struct PipelineWrapper<P>(pub P);

#[async_trait]
impl<P: TaskPipeline> ErasedPipeline for PipelineWrapper<P> {
    fn task_type(&self) -> &'static str {
        self.0.task_type()
    }

    fn step_names(&self) -> Vec<&'static str> {
        self.0.steps().names()
    }

    fn validate_erased(&self, parameters: &serde_json::Value) -> Result<(), TaskError> {
        let typed: P::Params = serde_json::from_value(parameters.clone())
            .map_err(|e| TaskError::ValidationError(e.to_string()))?;
        self.0
            .validate(&typed)
            .map_err(|e| TaskError::ValidationError(format!("{e:#}")))
    }

    async fn run_erased(
        &self,
        task_id: TaskId,
        store: &dyn TaskStore,
        events: &EventSink,
    ) -> RunOutcome {
        control::run_task(&self.0, task_id, store, events).await
    }
}
