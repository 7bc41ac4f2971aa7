//! Task runner: starts control loops and exposes the control surface.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use super::control;
use super::erased::{ErasedPipeline, PipelineWrapper};
use super::store::{TaskError, TaskStore};
use crate::broadcast::{lock, Broadcaster, EventStream};
use crate::config::EngineConfig;
use crate::pipeline::TaskPipeline;
use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

/// Control loops currently running, keyed by task. The flag asks the loop to
/// run once more when it stops.
type ActiveRuns = Arc<Mutex<HashMap<TaskId, bool>>>;

/// Runs tasks from a store through their registered pipelines.
///
/// At most one control loop runs per task. Executing or resuming a task
/// whose loop is active attaches to that loop instead of starting another.
pub struct Runner<S: TaskStore> {
    store: Arc<S>,
    pipelines: Arc<HashMap<&'static str, Arc<dyn ErasedPipeline>>>,
    broadcaster: Arc<Broadcaster>,
    active: ActiveRuns,
}

impl<S: TaskStore> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pipelines: self.pipelines.clone(),
            broadcaster: self.broadcaster.clone(),
            active: self.active.clone(),
        }
    }
}

impl<S: TaskStore + 'static> Runner<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.pipelines.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Step names of a registered task type.
    pub fn steps(&self, task_type: &str) -> Option<Vec<&'static str>> {
        self.pipelines.get(task_type).map(|p| p.step_names())
    }

    /// Validate parameters and create a `Pending` task.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn start(
        &self,
        task_type: &str,
        owner_id: &str,
        parameters: serde_json::Value,
    ) -> Result<Task, TaskError> {
        let pipeline = self.pipeline(task_type)?;
        pipeline.validate_erased(&parameters)?;

        let task = self.store.create(task_type, owner_id, parameters).await?;
        info!(task_id = %task.id, task_type, owner_id, "Task created");
        Ok(task)
    }

    /// Create a task from typed parameters.
    pub async fn submit<T: Serialize>(
        &self,
        task_type: &str,
        owner_id: &str,
        parameters: T,
    ) -> Result<TaskId, TaskError> {
        let json = serde_json::to_value(parameters)
            .map_err(|e| TaskError::SerializationError(e.to_string()))?;
        Ok(self.start(task_type, owner_id, json).await?.id)
    }

    /// Run a task and stream its events.
    ///
    /// A task that is not runnable yields a stream holding just the event
    /// for its current status.
    pub async fn execute(&self, id: TaskId) -> Result<EventStream, TaskError> {
        let task = self.store.get(id).await?;
        let pipeline = self.pipeline(&task.task_type)?;
        Ok(self.attach(id, pipeline, false))
    }

    /// Ask a running task to pause at its next observation point.
    pub async fn pause(&self, id: TaskId) -> Result<Task, TaskError> {
        let update = TaskUpdate::new()
            .status(TaskStatus::Paused)
            .paused_at(Utc::now())
            .when(&[TaskStatus::Running]);
        let task = self.store.update(id, update).await?;
        info!(task_id = %id, step = %task.current_step, "Task pause requested");
        Ok(task)
    }

    /// Resume a paused task, or retry a failed one, from its checkpoint.
    pub async fn resume(&self, id: TaskId) -> Result<EventStream, TaskError> {
        let task = self.store.get(id).await?;
        let pipeline = self.pipeline(&task.task_type)?;

        let update = TaskUpdate::new()
            .status(TaskStatus::Running)
            .clear_error()
            .when(&[TaskStatus::Paused, TaskStatus::Failed]);
        let task = self.store.update(id, update).await?;
        info!(task_id = %id, completed = task.completed_steps.len(), "Task resumed");

        Ok(self.attach(id, pipeline, true))
    }

    /// Cancel a task. An active loop stops at its next observation point
    /// without writing anything further.
    pub async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        let update = TaskUpdate::new()
            .status(TaskStatus::Cancelled)
            .cancelled_at(Utc::now())
            .when(&[TaskStatus::Running, TaskStatus::Paused, TaskStatus::Failed]);
        let task = self.store.update(id, update).await?;
        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    pub async fn status(&self, id: TaskId) -> Result<Task, TaskError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>, TaskError> {
        self.store.list_by_owner(owner_id, task_type).await
    }

    /// Make tasks orphaned by a previous process resumable. Call once on
    /// startup, before executing anything.
    pub async fn recover_orphans(&self) -> Result<usize, TaskError> {
        let recovered = self.store.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, "Recovered orphaned tasks");
        }
        Ok(recovered)
    }

    fn pipeline(&self, task_type: &str) -> Result<Arc<dyn ErasedPipeline>, TaskError> {
        self.pipelines
            .get(task_type)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTaskType(task_type.to_string()))
    }

    fn attach(&self, id: TaskId, pipeline: Arc<dyn ErasedPipeline>, rerun: bool) -> EventStream {
        let mut active = lock(&self.active);
        let stream = self.broadcaster.subscribe(id);
        match active.get_mut(&id) {
            Some(pending) => {
                *pending |= rerun;
                debug!(task_id = %id, rerun, "Attached to active run");
            }
            None => {
                active.insert(id, false);
                self.spawn_run(id, pipeline);
            }
        }
        stream
    }

    fn spawn_run(&self, id: TaskId, pipeline: Arc<dyn ErasedPipeline>) {
        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let sink = broadcaster.sink(id);
            loop {
                let run = pipeline.run_erased(id, store.as_ref(), &sink);
                let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = format!("step panicked: {}", panic_message(panic.as_ref()));
                        error!(task_id = %id, error = %message, "Task run panicked");
                        control::record_panic(store.as_ref(), id, message).await
                    }
                };

                let again = {
                    let mut active = lock(&active);
                    match active.get_mut(&id) {
                        Some(rerun) if *rerun => {
                            *rerun = false;
                            true
                        }
                        _ => {
                            broadcaster.publish(id, outcome.closing_event(id));
                            active.remove(&id);
                            broadcaster.close(id);
                            false
                        }
                    }
                };
                if !again {
                    debug!(task_id = %id, ?outcome, "Run finished");
                    break;
                }
                debug!(task_id = %id, "Running task again after resume");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: TaskStore> {
    store: S,
    pipelines: HashMap<&'static str, Arc<dyn ErasedPipeline>>,
    event_buffer: usize,
}

impl<S: TaskStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            pipelines: HashMap::new(),
            event_buffer: EngineConfig::default().event_buffer,
        }
    }

    /// Register a pipeline under its task type.
    ///
    /// # Panics
    ///
    /// Panics if another pipeline is already registered for the same type.
    pub fn pipeline<P: TaskPipeline>(mut self, pipeline: P) -> Self {
        let task_type = pipeline.task_type();
        assert!(
            !self.pipelines.contains_key(task_type),
            "task type '{task_type}' registered twice"
        );
        self.pipelines
            .insert(task_type, Arc::new(PipelineWrapper(pipeline)));
        self
    }

    /// Events kept per task for subscribers that fall behind.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn config(self, config: &EngineConfig) -> Self {
        self.event_buffer(config.event_buffer)
    }

    /// Build the runner.
    pub fn build(self) -> Runner<S> {
        Runner {
            store: Arc::new(self.store),
            pipelines: Arc::new(self.pipelines),
            broadcaster: Arc::new(Broadcaster::new(self.event_buffer)),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
