//! Task storage trait and error types.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

/// Error type for task operations.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid parameters: {0}")]
    ValidationError(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The task's current status does not allow the requested change.
    #[error("task {id} is {status}")]
    Conflict { id: TaskId, status: TaskStatus },
}

/// Trait for task record storage backends.
///
/// Every `update` is durable when it returns; the runner relies on this to
/// resume from the last checkpoint after a crash.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task in `Pending` status.
    async fn create(
        &self,
        task_type: &str,
        owner_id: &str,
        parameters: serde_json::Value,
    ) -> Result<Task, TaskError>;

    /// Fetch a task by id.
    async fn get(&self, id: TaskId) -> Result<Task, TaskError>;

    /// Atomically apply a partial update and return the updated task.
    ///
    /// Returns [`TaskError::Conflict`] without writing anything when the
    /// update's status precondition or the transition rules reject the
    /// task's current status.
    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError>;

    /// List the tasks of an owner, oldest first, optionally filtered by type.
    async fn list_by_owner(
        &self,
        owner_id: &str,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>, TaskError>;

    /// Move tasks left `Running` by a crashed process to `Paused`.
    /// Call on startup. Returns the number of tasks recovered.
    async fn recover_orphans(&self) -> Result<usize, TaskError> {
        Ok(0) // Default: no-op for stores that don't outlive the process
    }
}
