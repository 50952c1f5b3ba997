//! Task list domain types.
//!
//! A task is one unit of delegable work. Tasks carry optional ids (the
//! canonical comparison form strips a single leading `#`), a dependency list
//! in `blocked_by`, and a four-state lifecycle. All dependency comparisons in
//! the scheduler go through [`normalize_id`].

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// Legal moves: `Pending -> InProgress -> {Completed, Error}`. An `Error`
/// task permanently blocks its dependents until a remediation task
/// supersedes the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Error)
        )
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single unit of work in the session's task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Optional task id. Ids are compared after [`normalize_id`]; tasks with
    /// a missing or duplicated id never participate in dependency edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// What needs to be done.
    pub content: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Present-progressive display form (e.g. "Fixing the parser").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    /// Ids of tasks that must complete before this one can start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl Task {
    /// New pending task with the given id and content.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            content: content.into(),
            status: TaskStatus::Pending,
            active_form: None,
            blocked_by: Vec::new(),
        }
    }

    /// The normalized form of this task's id, if present.
    pub fn normalized_id(&self) -> Option<String> {
        self.id.as_deref().map(normalize_id)
    }
}

/// Canonicalize a task id by stripping a single leading `#`.
///
/// Exactly one `#` is stripped, never more: `"##1"` normalizes to `"#1"`.
/// No other prefixing convention is recognized.
pub fn normalize_id(id: &str) -> String {
    id.strip_prefix('#').unwrap_or(id).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_single_hash() {
        assert_eq!(normalize_id("#1"), "1");
        assert_eq!(normalize_id("1"), "1");
        assert_eq!(normalize_id("##1"), "#1");
        assert_eq!(normalize_id(""), "");
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_task_serde_roundtrip() {
        let task = Task {
            id: Some("#2".to_string()),
            content: "Wire up the parser".to_string(),
            status: TaskStatus::Pending,
            active_form: Some("Wiring up the parser".to_string()),
            blocked_by: vec!["#1".to_string()],
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("#2"));
        assert_eq!(parsed.blocked_by, vec!["#1"]);
    }

    #[test]
    fn test_task_serde_defaults() {
        // Minimal JSON: id, active_form, blocked_by all optional
        let parsed: Task =
            serde_json::from_str(r#"{"content":"do it","status":"in_progress"}"#).unwrap();
        assert!(parsed.id.is_none());
        assert!(parsed.blocked_by.is_empty());
        assert_eq!(parsed.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_normalized_id() {
        let task = Task::new("#7", "x");
        assert_eq!(task.normalized_id().as_deref(), Some("7"));
        let anon = Task {
            id: None,
            content: "y".to_string(),
            status: TaskStatus::Pending,
            active_form: None,
            blocked_by: vec![],
        };
        assert!(anon.normalized_id().is_none());
    }
}
