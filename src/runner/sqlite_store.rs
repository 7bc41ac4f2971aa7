//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::store::{TaskError, TaskStore};
use crate::task::{Task, TaskId, TaskStatus, TaskUpdate};

const COLUMNS: &str = "id, task_type, owner_id, status, parameters, current_step, progress, \
     completed_steps, intermediate_data, error_message, created_at, paused_at, cancelled_at, \
     completed_at, revision";

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    task_type: String,
    owner_id: String,
    status: String,
    parameters: String,
    current_step: String,
    progress: i64,
    completed_steps: String,
    intermediate_data: String,
    error_message: Option<String>,
    created_at: String,
    paused_at: Option<String>,
    cancelled_at: Option<String>,
    completed_at: Option<String>,
    revision: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId(row.id),
            task_type: row.task_type,
            owner_id: row.owner_id,
            status: row.status.parse().map_err(TaskError::SerializationError)?,
            parameters: from_json(&row.parameters)?,
            current_step: row.current_step,
            progress: row.progress.clamp(0, 100) as u8,
            completed_steps: from_json(&row.completed_steps)?,
            intermediate_data: from_json(&row.intermediate_data)?,
            error: row.error_message,
            created_at: parse_timestamp(&row.created_at)?,
            paused_at: row.paused_at.as_deref().map(parse_timestamp).transpose()?,
            cancelled_at: row.cancelled_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            revision: row.revision.max(0) as u64,
        })
    }
}

fn storage(e: sqlx::Error) -> TaskError {
    TaskError::StorageError(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(|e| TaskError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, TaskError> {
    serde_json::from_str(raw).map_err(|e| TaskError::SerializationError(e.to_string()))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TaskError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaskError::SerializationError(format!("bad timestamp {raw:?}: {e}")))
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the tasks table.
    pub async fn run_migrations(&self) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS waypoint_tasks (
                id INTEGER PRIMARY KEY,
                task_type TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                parameters TEXT NOT NULL,
                current_step TEXT NOT NULL DEFAULT '',
                progress INTEGER NOT NULL DEFAULT 0,
                completed_steps TEXT NOT NULL DEFAULT '[]',
                intermediate_data TEXT NOT NULL DEFAULT 'null',
                error_message TEXT,
                created_at TEXT NOT NULL,
                paused_at TEXT,
                cancelled_at TEXT,
                completed_at TEXT,
                revision INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_waypoint_tasks_owner
            ON waypoint_tasks(owner_id, task_type)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_waypoint_tasks_status
            ON waypoint_tasks(status)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn current_status(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM waypoint_tasks WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        status
            .ok_or(TaskError::NotFound(id))?
            .parse()
            .map_err(TaskError::SerializationError)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(
        &self,
        task_type: &str,
        owner_id: &str,
        parameters: serde_json::Value,
    ) -> Result<Task, TaskError> {
        let query = format!(
            r#"
            INSERT INTO waypoint_tasks (task_type, owner_id, parameters, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        );

        let row: TaskRow = sqlx::query_as(&query)
            .bind(task_type)
            .bind(owner_id)
            .bind(to_json(&parameters)?)
            .bind(Utc::now().to_rfc3339())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        row.try_into()
    }

    async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        let query = format!("SELECT {COLUMNS} FROM waypoint_tasks WHERE id = ?");
        let row: Option<TaskRow> = sqlx::query_as(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.ok_or(TaskError::NotFound(id))?.try_into()
    }

    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        let permitted = update.permitted_from();
        if permitted.as_ref().is_some_and(|p| p.is_empty()) {
            let status = self.current_status(id).await?;
            return Err(TaskError::Conflict { id, status });
        }

        // One statement: the status check and the write cannot interleave
        // with another writer.
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE waypoint_tasks SET revision = revision + 1");

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(step) = update.current_step {
            qb.push(", current_step = ").push_bind(step);
        }
        if let Some(progress) = update.progress {
            qb.push(", progress = MAX(progress, ")
                .push_bind(i64::from(progress.min(100)))
                .push(")");
        }
        if let Some(steps) = update.completed_steps {
            qb.push(", completed_steps = ").push_bind(to_json(&steps)?);
        }
        if let Some(data) = update.intermediate_data {
            qb.push(", intermediate_data = ").push_bind(to_json(&data)?);
        }
        if let Some(error) = update.error {
            qb.push(", error_message = ").push_bind(error);
        }
        if let Some(at) = update.paused_at {
            qb.push(", paused_at = ").push_bind(at.to_rfc3339());
        }
        if let Some(at) = update.cancelled_at {
            qb.push(", cancelled_at = ").push_bind(at.to_rfc3339());
        }
        if let Some(at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(at.to_rfc3339());
        }

        qb.push(" WHERE id = ").push_bind(id.0);

        if let Some(permitted) = permitted {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in permitted {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }

        qb.push(" RETURNING ").push(COLUMNS);

        let row: Option<TaskRow> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let status = self.current_status(id).await?;
                Err(TaskError::Conflict { id, status })
            }
        }
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>, TaskError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM waypoint_tasks WHERE owner_id = "
        ));
        qb.push_bind(owner_id);
        if let Some(task_type) = task_type {
            qb.push(" AND task_type = ").push_bind(task_type);
        }
        qb.push(" ORDER BY id");

        let rows: Vec<TaskRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn recover_orphans(&self) -> Result<usize, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE waypoint_tasks
            SET status = 'PAUSED', paused_at = ?, revision = revision + 1
            WHERE status = 'RUNNING'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() as usize)
    }
}
