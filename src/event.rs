//! Progress and lifecycle events streamed to observers.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// An event emitted by a task's control loop.
///
/// Serialized as a `type`-tagged JSON object, one per line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    Progress {
        step: String,
        progress: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    StepComplete {
        step: String,
        message: String,
        completed_steps: Vec<String>,
    },
    Paused {
        message: String,
        can_resume: bool,
    },
    Done {
        task_id: TaskId,
        message: String,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Cancelled,
}

impl TaskEvent {
    /// Events after which a stream has nothing more to say.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            TaskEvent::Paused { .. }
                | TaskEvent::Done { .. }
                | TaskEvent::Error { .. }
                | TaskEvent::Cancelled
        )
    }

    /// Short name of the event kind, as used in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::StepComplete { .. } => "stepComplete",
            TaskEvent::Paused { .. } => "paused",
            TaskEvent::Done { .. } => "done",
            TaskEvent::Error { .. } => "error",
            TaskEvent::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = TaskEvent::StepComplete {
            step: "fetch".into(),
            message: "Fetched".into(),
            completed_steps: vec!["fetch".into()],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "stepComplete", "step": "fetch", "message": "Fetched", "completedSteps": ["fetch"]})
        );

        let paused = TaskEvent::Paused {
            message: "Task paused".into(),
            can_resume: true,
        };
        assert_eq!(
            serde_json::to_value(&paused).unwrap(),
            json!({"type": "paused", "message": "Task paused", "canResume": true})
        );

        assert_eq!(
            serde_json::to_value(TaskEvent::Cancelled).unwrap(),
            json!({"type": "cancelled"})
        );
    }

    #[test]
    fn test_progress_omits_missing_data() {
        let event = TaskEvent::Progress {
            step: "analyze".into(),
            progress: 30,
            message: "Analyzing".into(),
            data: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["type"], "progress");
        assert!(!event.is_closing());
    }

    #[test]
    fn test_done_round_trips() {
        let event = TaskEvent::Done {
            task_id: TaskId(3),
            message: "Task completed".into(),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"taskId\":3"));
        assert_eq!(serde_json::from_str::<TaskEvent>(&line).unwrap(), event);
        assert_eq!(event.kind(), "done");
    }
}
