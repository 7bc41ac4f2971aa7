//! In-process implementation of TaskStore.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::store::{TaskError, TaskStore};
use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

/// Task store kept in memory.
///
/// Updates are applied under a single write lock, which makes each one
/// atomic and immediately visible to readers. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        task_type: &str,
        owner_id: &str,
        parameters: serde_json::Value,
    ) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().await;
        let next_id = tasks.keys().next_back().map_or(1, |id| id.0 + 1);
        let task = Task::new(TaskId(next_id), task_type, owner_id, parameters);
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;

        if !update.permits(task.status) {
            return Err(TaskError::Conflict {
                id,
                status: task.status,
            });
        }

        task.apply(update);
        Ok(task.clone())
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>, TaskError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.owner_id == owner_id)
            .filter(|t| task_type.map_or(true, |ty| t.task_type == ty))
            .cloned()
            .collect())
    }

    async fn recover_orphans(&self) -> Result<usize, TaskError> {
        let mut tasks = self.tasks.write().await;
        let now = Utc::now();
        let mut recovered = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.apply(TaskUpdate::new().status(TaskStatus::Paused).paused_at(now));
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
