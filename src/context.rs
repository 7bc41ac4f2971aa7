//! What a step executor sees while it runs.

use tracing::debug;

use crate::broadcast::EventSink;
use crate::checkpoint::{self, CheckpointData};
use crate::event::TaskEvent;
use crate::runner::{TaskError, TaskStore};
use crate::step::{Interrupt, StepError};
use crate::task::{TaskId, TaskStatus, TaskUpdate};

/// Statuses under which an in-flight step may still write its checkpoint.
/// A pause keeps the work done so far; a cancel discards it.
pub(crate) const CHECKPOINT_STATUSES: &[TaskStatus] = &[TaskStatus::Running, TaskStatus::Paused];

/// Execution context of one step of one task.
///
/// Gives the step its parameters and mutable intermediate data, and lets
/// multi-unit steps checkpoint, report sub-progress, and observe pause or
/// cancel requests between units.
pub struct StepContext<'a, P, D> {
    task_id: TaskId,
    owner_id: &'a str,
    step: &'static str,
    params: &'a P,
    data: &'a mut D,
    store: &'a dyn TaskStore,
    events: &'a EventSink,
    progress: u8,
    /// Progress span of this step: its own weight up to the next step's.
    span: (u8, u8),
}

impl<'a, P, D> StepContext<'a, P, D>
where
    P: Sync,
    D: CheckpointData,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_id: TaskId,
        owner_id: &'a str,
        step: &'static str,
        params: &'a P,
        data: &'a mut D,
        store: &'a dyn TaskStore,
        events: &'a EventSink,
        progress: u8,
        span: (u8, u8),
    ) -> Self {
        Self {
            task_id,
            owner_id,
            step,
            params,
            data,
            store,
            events,
            progress,
            span: (span.0, span.1.max(span.0)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn owner_id(&self) -> &'a str {
        self.owner_id
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    /// The task's parameters. Borrowed for the whole step, so they can be
    /// held while the intermediate data is mutated.
    pub fn params(&self) -> &'a P {
        self.params
    }

    pub fn data(&self) -> &D {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        self.data
    }

    /// Last progress percentage persisted for the task.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Re-read the task status and stop the step if it was paused or
    /// cancelled. Any status other than running ends the step: the run no
    /// longer owns the task.
    pub async fn check_interrupt(&self) -> Result<(), StepError> {
        let task = self.store.get(self.task_id).await?;
        match task.status {
            TaskStatus::Running => Ok(()),
            status => {
                debug!(task_id = %self.task_id, step = self.step, %status, "Step interrupted");
                Err(interrupted(status))
            }
        }
    }

    /// Persist the intermediate data as it is now.
    pub async fn checkpoint(&mut self) -> Result<(), StepError> {
        let data = encode(self.data)?;
        self.write(TaskUpdate::new().intermediate_data(data)).await
    }

    /// Persist the intermediate data together with sub-progress `done` of
    /// `total`, then emit a progress event for it.
    ///
    /// Progress is spread between this step's weight and the next step's,
    /// and never drops below what was already persisted.
    pub async fn advance(
        &mut self,
        done: usize,
        total: usize,
        message: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) -> Result<(), StepError> {
        let progress = self.interpolate(done, total);
        let data = encode(self.data)?;
        self.write(TaskUpdate::new().intermediate_data(data).progress(progress))
            .await?;
        self.progress = progress;

        self.events.emit(TaskEvent::Progress {
            step: self.step.to_string(),
            progress,
            message: message.into(),
            data: detail,
        });
        Ok(())
    }

    fn interpolate(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.span;
        if total == 0 {
            return self.progress;
        }
        let reached = usize::from(start) + usize::from(end - start) * done.min(total) / total;
        // Stay below the next step's weight until the step completes.
        let ceiling = usize::from(end.saturating_sub(1).max(start));
        (reached.min(ceiling) as u8).max(self.progress)
    }

    async fn write(&self, update: TaskUpdate) -> Result<(), StepError> {
        match self
            .store
            .update(self.task_id, update.when(CHECKPOINT_STATUSES))
            .await
        {
            Ok(_) => Ok(()),
            Err(TaskError::Conflict { status, .. }) => Err(interrupted(status)),
            Err(e) => Err(e.into()),
        }
    }
}

fn interrupted(status: TaskStatus) -> StepError {
    match status {
        TaskStatus::Paused => StepError::Interrupted(Interrupt::Paused),
        _ => StepError::Interrupted(Interrupt::Cancelled),
    }
}

fn encode<D: CheckpointData>(data: &D) -> Result<serde_json::Value, StepError> {
    checkpoint::encode(data).map_err(StepError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::runner::InMemoryTaskStore;
    use std::sync::Arc;

    async fn running_task(store: &InMemoryTaskStore) -> TaskId {
        let task = store
            .create("analysis", "client-1", serde_json::json!({}))
            .await
            .unwrap();
        store
            .update(task.id, TaskUpdate::new().status(TaskStatus::Running))
            .await
            .unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_advance_interpolates_within_step_span() {
        let store = InMemoryTaskStore::new();
        let id = running_task(&store).await;
        let broadcaster = Arc::new(Broadcaster::new(16));
        let sink = broadcaster.sink(id);
        let mut data = ();

        let mut ctx = StepContext::new(id, "client-1", "analyze", &(), &mut data, &store, &sink, 30, (30, 90));
        ctx.advance(3, 5, "3 of 5", None).await.unwrap();
        assert_eq!(ctx.progress(), 66);
        assert_eq!(store.get(id).await.unwrap().progress, 66);

        // The last unit stays below the next step's weight.
        ctx.advance(5, 5, "5 of 5", None).await.unwrap();
        assert_eq!(ctx.progress(), 89);
    }

    #[tokio::test]
    async fn test_resumed_step_never_reports_lower_progress() {
        let store = InMemoryTaskStore::new();
        let id = running_task(&store).await;
        let broadcaster = Arc::new(Broadcaster::new(16));
        let sink = broadcaster.sink(id);
        let mut data = ();

        let mut ctx = StepContext::new(id, "client-1", "analyze", &(), &mut data, &store, &sink, 66, (30, 90));
        ctx.advance(1, 5, "1 of 5", None).await.unwrap();
        assert_eq!(ctx.progress(), 66);
    }

    #[tokio::test]
    async fn test_pause_keeps_checkpoint_and_cancel_interrupts() {
        let store = InMemoryTaskStore::new();
        let id = running_task(&store).await;
        let broadcaster = Arc::new(Broadcaster::new(16));
        let sink = broadcaster.sink(id);
        let mut data = ();

        let mut ctx = StepContext::new(id, "client-1", "analyze", &(), &mut data, &store, &sink, 30, (30, 90));
        assert!(ctx.check_interrupt().await.is_ok());

        store
            .update(id, TaskUpdate::new().status(TaskStatus::Paused))
            .await
            .unwrap();
        ctx.checkpoint().await.unwrap();
        assert_eq!(
            ctx.check_interrupt().await.unwrap_err().interrupt(),
            Some(Interrupt::Paused)
        );

        store
            .update(id, TaskUpdate::new().status(TaskStatus::Cancelled))
            .await
            .unwrap();
        let revision = store.get(id).await.unwrap().revision;
        let err = ctx.advance(1, 5, "1 of 5", None).await.unwrap_err();
        assert_eq!(err.interrupt(), Some(Interrupt::Cancelled));
        assert_eq!(store.get(id).await.unwrap().revision, revision);
    }
}
