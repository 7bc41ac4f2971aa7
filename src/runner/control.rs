//! The per-task control loop.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::{TaskError, TaskStore};
use crate::broadcast::EventSink;
use crate::checkpoint;
use crate::context::{StepContext, CHECKPOINT_STATUSES};
use crate::event::TaskEvent;
use crate::pipeline::TaskPipeline;
use crate::step::{StepError, StepName};
use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

/// How a run of the control loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed { message: String, recoverable: bool },
}

impl RunOutcome {
    /// The event that closes subscriber streams for this outcome.
    pub fn closing_event(&self, task_id: TaskId) -> TaskEvent {
        match self {
            RunOutcome::Completed => TaskEvent::Done {
                task_id,
                message: "Task completed".to_string(),
            },
            RunOutcome::Paused => TaskEvent::Paused {
                message: "Task paused".to_string(),
                can_resume: true,
            },
            RunOutcome::Cancelled => TaskEvent::Cancelled,
            RunOutcome::Failed {
                message,
                recoverable,
            } => TaskEvent::Error {
                message: message.clone(),
                recoverable: *recoverable,
            },
        }
    }

    /// The outcome a task's persisted status stands for.
    fn of(task: &Task) -> Self {
        match task.status {
            TaskStatus::Completed => RunOutcome::Completed,
            TaskStatus::Cancelled => RunOutcome::Cancelled,
            TaskStatus::Failed => RunOutcome::Failed {
                message: task
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
                recoverable: true,
            },
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused => RunOutcome::Paused,
        }
    }
}

/// Run `pipeline` over task `task_id` until it completes, fails, or observes
/// a pause or cancel. Closing events are left to the caller.
pub(crate) async fn run_task<P: TaskPipeline>(
    pipeline: &P,
    task_id: TaskId,
    store: &dyn TaskStore,
    events: &EventSink,
) -> RunOutcome {
    match drive(pipeline, task_id, store, events).await {
        Ok(outcome) => outcome,
        Err(TaskError::NotFound(id)) => {
            warn!(task_id = %id, "Task not found");
            RunOutcome::Failed {
                message: format!("task {id} not found"),
                recoverable: false,
            }
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Task run aborted");
            let message = e.to_string();
            let update = TaskUpdate::new()
                .status(TaskStatus::Failed)
                .error(&message)
                .when(&[TaskStatus::Running]);
            if let Err(write_err) = store.update(task_id, update).await {
                warn!(task_id = %task_id, error = %write_err, "Could not record task failure");
            }
            RunOutcome::Failed {
                message,
                recoverable: true,
            }
        }
    }
}

async fn drive<P: TaskPipeline>(
    pipeline: &P,
    task_id: TaskId,
    store: &dyn TaskStore,
    events: &EventSink,
) -> Result<RunOutcome, TaskError> {
    let mut task = store.get(task_id).await?;

    if task.status == TaskStatus::Pending {
        let start = TaskUpdate::new()
            .status(TaskStatus::Running)
            .when(&[TaskStatus::Pending]);
        task = match store.update(task_id, start).await {
            Ok(task) => task,
            Err(TaskError::Conflict { .. }) => return settle(store, task_id).await,
            Err(e) => return Err(e),
        };
        info!(task_id = %task_id, task_type = %task.task_type, "Task started");
    }
    if task.status != TaskStatus::Running {
        debug!(task_id = %task_id, status = %task.status, "Task not running");
        return Ok(RunOutcome::of(&task));
    }

    let params: P::Params = match serde_json::from_value(task.parameters.clone()) {
        Ok(params) => params,
        Err(e) => return fail(store, task_id, None, format!("invalid parameters: {e}")).await,
    };
    let mut data: P::Data = match checkpoint::decode(&task.intermediate_data) {
        Ok(data) => data,
        Err(e) => return fail(store, task_id, None, format!("unreadable checkpoint: {e}")).await,
    };

    let table = pipeline.steps();
    let mut completed = task.completed_steps.clone();

    for (index, spec) in table.steps().iter().enumerate() {
        let name = spec.step.as_str();
        if task.is_step_completed(name) {
            debug!(task_id = %task_id, step = name, "Skipping completed step");
            continue;
        }

        let current = store.get(task_id).await?;
        if current.status != TaskStatus::Running {
            info!(task_id = %task_id, step = name, status = %current.status, "Task stopped before step");
            return Ok(RunOutcome::of(&current));
        }

        let begin = TaskUpdate::new()
            .current_step(name)
            .progress(spec.progress)
            .when(&[TaskStatus::Running]);
        let progress = match store.update(task_id, begin).await {
            Ok(task) => task.progress,
            Err(TaskError::Conflict { .. }) => return settle(store, task_id).await,
            Err(e) => return Err(e),
        };
        events.emit(TaskEvent::Progress {
            step: name.to_string(),
            progress,
            message: spec.message.to_string(),
            data: None,
        });
        info!(task_id = %task_id, step = name, progress, "Step started");

        let result = {
            let mut ctx = StepContext::new(
                task_id,
                &task.owner_id,
                name,
                &params,
                &mut data,
                store,
                events,
                progress,
                (spec.progress, table.end_progress(index)),
            );
            pipeline.execute(spec.step, &mut ctx).await
        };

        match result {
            Ok(()) => {
                let encoded = match checkpoint::encode(&data) {
                    Ok(encoded) => encoded,
                    Err(e) => return fail(store, task_id, Some(name), e.to_string()).await,
                };
                completed.push(name.to_string());
                let finish = TaskUpdate::new()
                    .completed_steps(completed.clone())
                    .intermediate_data(encoded)
                    .when(CHECKPOINT_STATUSES);
                match store.update(task_id, finish).await {
                    Ok(_) => {}
                    Err(TaskError::Conflict { .. }) => return settle(store, task_id).await,
                    Err(e) => return Err(e),
                }
                events.emit(TaskEvent::StepComplete {
                    step: name.to_string(),
                    message: format!("Step '{name}' complete"),
                    completed_steps: completed.clone(),
                });
                info!(task_id = %task_id, step = name, "Step completed");
            }
            Err(StepError::Interrupted(interrupt)) => {
                info!(task_id = %task_id, step = name, %interrupt, "Step interrupted");
                return settle(store, task_id).await;
            }
            Err(StepError::Store(TaskError::Conflict { .. })) => {
                return settle(store, task_id).await;
            }
            Err(StepError::Store(e)) => return Err(e),
            Err(StepError::Failed(cause)) => {
                return fail(store, task_id, Some(name), format!("{cause:#}")).await;
            }
        }
    }

    let done = TaskUpdate::new()
        .status(TaskStatus::Completed)
        .progress(100)
        .current_step("")
        .completed_at(Utc::now())
        .when(&[TaskStatus::Running]);
    match store.update(task_id, done).await {
        Ok(_) => {
            info!(task_id = %task_id, "Task completed");
            Ok(RunOutcome::Completed)
        }
        Err(TaskError::Conflict { .. }) => settle(store, task_id).await,
        Err(e) => Err(e),
    }
}

/// Persist a step failure. The checkpoint is left as it is.
async fn fail(
    store: &dyn TaskStore,
    task_id: TaskId,
    step: Option<&str>,
    message: String,
) -> Result<RunOutcome, TaskError> {
    error!(task_id = %task_id, step = ?step, error = %message, "Task failed");
    let update = TaskUpdate::new()
        .status(TaskStatus::Failed)
        .error(&message)
        .when(&[TaskStatus::Running]);
    match store.update(task_id, update).await {
        Ok(_) => Ok(RunOutcome::Failed {
            message,
            recoverable: true,
        }),
        Err(TaskError::Conflict { .. }) => settle(store, task_id).await,
        Err(e) => Err(e),
    }
}

/// Fail a task whose run panicked. The panic is treated like a step
/// failure: the checkpoint is kept and the task can be resumed.
pub(crate) async fn record_panic(
    store: &dyn TaskStore,
    task_id: TaskId,
    message: String,
) -> RunOutcome {
    match fail(store, task_id, None, message.clone()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Could not record task panic");
            RunOutcome::Failed {
                message,
                recoverable: true,
            }
        }
    }
}

/// Re-read the task after a rejected write or an interrupted step.
async fn settle(store: &dyn TaskStore, task_id: TaskId) -> Result<RunOutcome, TaskError> {
    let task = store.get(task_id).await?;
    debug!(task_id = %task_id, status = %task.status, "Settling run");
    Ok(RunOutcome::of(&task))
}
