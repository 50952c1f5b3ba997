//! Session domain types.
//!
//! A session is the durable, resumable unit corresponding to one
//! iterate-until-done run. It is the projection of an execution's state that
//! gets rewritten to `session.json` on every status-affecting transition and
//! reloaded at resume.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::Task;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
///
/// Legal moves: `Running -> {Paused, Completed, Failed}` and
/// `Paused -> Running`. Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Running, SessionStatus::Paused)
                | (SessionStatus::Running, SessionStatus::Completed)
                | (SessionStatus::Running, SessionStatus::Failed)
                | (SessionStatus::Paused, SessionStatus::Running)
        )
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Optional pull-request handoff metadata reported by the delegated agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// The durable record of one iterate-until-done run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id (UUIDv7 string).
    pub session_id: String,
    /// Dedicated durable directory for this session.
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Current task list.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Completed loop iterations so far.
    #[serde(default)]
    pub iteration: u64,
    pub status: SessionStatus,
    /// Normalized ids of tasks completed so far, in completion order.
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrMetadata>,
}

impl Session {
    /// Fresh running session rooted at `directory`.
    pub fn new(session_id: impl Into<String>, directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            directory,
            created_at: now,
            last_updated: now,
            tasks: Vec::new(),
            iteration: 0,
            status: SessionStatus::Running,
            completed_task_ids: Vec::new(),
            pr: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Running));

        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Running));
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Running));
        assert!(!SessionStatus::Paused.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_session_json_roundtrip() {
        let mut session = Session::new("01938e90-x", PathBuf::from("/tmp/ratchet/s1"));
        session.tasks.push(Task::new("#1", "Bootstrap the repo"));
        session.tasks[0].status = TaskStatus::Completed;
        session.completed_task_ids.push("1".to_string());
        session.iteration = 2;
        session.pr = Some(PrMetadata {
            number: Some(42),
            url: Some("https://example.com/pr/42".to_string()),
            branch: None,
        });

        let json = serde_json::to_string_pretty(&session).unwrap();
        assert!(json.contains("\"status\": \"running\""));
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.iteration, 2);
        assert_eq!(parsed.completed_task_ids, vec!["1"]);
        assert_eq!(parsed.pr.unwrap().number, Some(42));
    }

    #[test]
    fn test_session_minimal_json() {
        // Older records without tasks/iteration fields still load.
        let parsed: Session = serde_json::from_str(
            r#"{
                "session_id": "abc",
                "directory": "/tmp/s",
                "created_at": "2026-08-01T00:00:00Z",
                "last_updated": "2026-08-01T00:00:00Z",
                "status": "paused"
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.status, SessionStatus::Paused);
        assert!(parsed.tasks.is_empty());
        assert_eq!(parsed.iteration, 0);
    }
}
