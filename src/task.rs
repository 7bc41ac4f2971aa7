//! Task records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether a task in this status may move to `next`.
    ///
    /// `Failed` can be retried (back to `Running`) or cancelled; `Completed`
    /// and `Cancelled` are final.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Failed, Running)
                | (Failed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// A task as persisted in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub owner_id: String,
    pub status: TaskStatus,
    pub parameters: serde_json::Value,
    /// Name of the step being executed, empty when none.
    pub current_step: String,
    pub progress: u8,
    pub completed_steps: Vec<String>,
    pub intermediate_data: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of updates applied to this record.
    pub revision: u64,
}

impl Task {
    /// A freshly created task in `Pending` status.
    pub fn new(id: TaskId, task_type: &str, owner_id: &str, parameters: serde_json::Value) -> Self {
        Self {
            id,
            task_type: task_type.to_string(),
            owner_id: owner_id.to_string(),
            status: TaskStatus::Pending,
            parameters,
            current_step: String::new(),
            progress: 0,
            completed_steps: Vec::new(),
            intermediate_data: serde_json::Value::Null,
            error: None,
            created_at: Utc::now(),
            paused_at: None,
            cancelled_at: None,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Apply `update` in memory. Callers check [`TaskUpdate::permits`] first.
    pub fn apply(&mut self, update: TaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(steps) = update.completed_steps {
            self.completed_steps = steps;
        }
        if let Some(data) = update.intermediate_data {
            self.intermediate_data = data;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(at) = update.paused_at {
            self.paused_at = Some(at);
        }
        if let Some(at) = update.cancelled_at {
            self.cancelled_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        self.revision += 1;
    }
}

/// A partial update of a task record, applied atomically.
///
/// An update may carry a status precondition (`when`). Stores apply the
/// update only when the current status satisfies both the precondition and
/// the transition rules of [`TaskStatus::can_transition_to`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    pub completed_steps: Option<Vec<String>>,
    pub intermediate_data: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub when: Option<Vec<TaskStatus>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn completed_steps(mut self, steps: Vec<String>) -> Self {
        self.completed_steps = Some(steps);
        self
    }

    pub fn intermediate_data(mut self, data: serde_json::Value) -> Self {
        self.intermediate_data = Some(data);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn paused_at(mut self, at: DateTime<Utc>) -> Self {
        self.paused_at = Some(at);
        self
    }

    pub fn cancelled_at(mut self, at: DateTime<Utc>) -> Self {
        self.cancelled_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Only apply while the task is in one of `statuses`.
    pub fn when(mut self, statuses: &[TaskStatus]) -> Self {
        self.when = Some(statuses.to_vec());
        self
    }

    /// Current statuses under which this update may be applied, or `None`
    /// when any status is acceptable.
    pub fn permitted_from(&self) -> Option<Vec<TaskStatus>> {
        let by_transition = self.status.map(|next| {
            TaskStatus::ALL
                .into_iter()
                .filter(|current| *current == next || current.can_transition_to(next))
                .collect::<Vec<_>>()
        });

        match (self.when.as_ref(), by_transition) {
            (None, None) => None,
            (Some(when), None) => Some(when.clone()),
            (None, Some(allowed)) => Some(allowed),
            (Some(when), Some(allowed)) => Some(
                allowed
                    .into_iter()
                    .filter(|status| when.contains(status))
                    .collect(),
            ),
        }
    }

    pub fn permits(&self, current: TaskStatus) -> bool {
        self.permitted_from()
            .map_or(true, |allowed| allowed.contains(&current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_dag() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Running));
        assert!(Failed.can_transition_to(Cancelled));

        for next in TaskStatus::ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_permitted_from_combines_guard_and_transitions() {
        let update = TaskUpdate::new()
            .status(TaskStatus::Failed)
            .when(&[TaskStatus::Running, TaskStatus::Paused]);
        // Paused cannot move to Failed, so only Running survives.
        assert_eq!(update.permitted_from(), Some(vec![TaskStatus::Running]));

        let checkpoint = TaskUpdate::new().progress(40);
        assert_eq!(checkpoint.permitted_from(), None);
        assert!(checkpoint.permits(TaskStatus::Cancelled));
    }

    #[test]
    fn test_apply_never_lowers_progress() {
        let mut task = Task::new(TaskId(1), "analysis", "client-1", serde_json::json!({}));
        task.apply(TaskUpdate::new().progress(60));
        task.apply(TaskUpdate::new().progress(30));
        assert_eq!(task.progress, 60);
        assert_eq!(task.revision, 2);
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let task = Task::new(TaskId(7), "analysis", "client-1", serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskType"], "analysis");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["completedSteps"], serde_json::json!([]));
    }
}
