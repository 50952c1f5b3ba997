//! Well-known state keys the session graph reads and writes, plus typed
//! accessors over the free-form outputs map.
//!
//! Everything the iteration body needs crosses node boundaries through
//! these keys, so a resumed execution reconstructs the session picture
//! from any checkpoint.

use ratchet_types::execution::{ExecutionState, StateUpdate};
use ratchet_types::session::Session;
use ratchet_types::task::{Task, TaskStatus};
use serde_json::{json, Value};

use crate::graph::node::NodeError;

pub const KEY_TASKS: &str = "session.tasks";
pub const KEY_ITERATION: &str = "session.iteration";
pub const KEY_COMPLETED: &str = "session.completed";
pub const KEY_CURRENT_INDEX: &str = "session.current_index";
pub const KEY_TRANSCRIPT: &str = "session.transcript";
pub const KEY_VERDICT: &str = "session.verdict";
pub const KEY_PROMPT: &str = "session.prompt";
pub const KEY_LAST_FAILURE: &str = "session.last_failure";
pub const KEY_DEADLOCKED: &str = "session.deadlocked";
pub const KEY_CAPPED: &str = "session.capped";

/// Build the initial execution state for a session. The execution id is the
/// session id, so checkpoints and the durable session line up.
///
/// An `in_progress` task in the durable record means a selection was
/// persisted but its attempt never finished; it goes back to pending so
/// the loop re-executes it. Terminal tasks are untouched.
pub fn seed(session: &Session) -> Result<ExecutionState, NodeError> {
    let mut tasks = session.tasks.clone();
    for task in &mut tasks {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
        }
    }
    let mut update = StateUpdate::new();
    set_tasks(&mut update, &tasks)?;
    update.insert(KEY_ITERATION.to_string(), json!(session.iteration));
    update.insert(
        KEY_COMPLETED.to_string(),
        json!(session.completed_task_ids),
    );
    Ok(ExecutionState::new(&session.session_id).merge(update))
}

/// Fold the final execution state back into the durable session record.
pub fn apply(session: &mut Session, state: &ExecutionState) {
    session.tasks = tasks(state);
    session.iteration = state.get_u64(KEY_ITERATION);
    session.completed_task_ids = completed_ids(state);
    session.last_updated = state.last_updated;
}

pub fn tasks(state: &ExecutionState) -> Vec<Task> {
    state
        .get(KEY_TASKS)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn set_tasks(update: &mut StateUpdate, tasks: &[Task]) -> Result<(), NodeError> {
    let value = serde_json::to_value(tasks).map_err(|e| NodeError::new(e.to_string()))?;
    update.insert(KEY_TASKS.to_string(), value);
    Ok(())
}

pub fn completed_ids(state: &ExecutionState) -> Vec<String> {
    state
        .get(KEY_COMPLETED)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn current_index(state: &ExecutionState) -> Option<usize> {
    match state.get(KEY_CURRENT_INDEX) {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
        _ => None,
    }
}

pub fn transcript(state: &ExecutionState) -> Option<&str> {
    state.get(KEY_TRANSCRIPT).and_then(Value::as_str)
}

pub fn last_failure(state: &ExecutionState) -> Option<&str> {
    state.get(KEY_LAST_FAILURE).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ratchet_types::task::TaskStatus;

    use super::*;

    fn task(id: &str) -> Task {
        Task {
            id: Some(id.to_string()),
            content: format!("do {id}"),
            status: TaskStatus::Pending,
            active_form: None,
            blocked_by: vec![],
        }
    }

    #[test]
    fn test_seed_and_apply_roundtrip() {
        let mut session = Session::new("sess-1", PathBuf::from("/tmp/demo"));
        session.tasks = vec![task("#1")];
        session.iteration = 4;
        session.completed_task_ids = vec!["#0".to_string()];

        let state = seed(&session).unwrap();
        assert_eq!(state.execution_id, session.session_id);
        assert_eq!(state.get_u64(KEY_ITERATION), 4);
        assert_eq!(tasks(&state).len(), 1);
        assert_eq!(completed_ids(&state), vec!["#0"]);

        let mut restored = Session::new("sess-1", PathBuf::from("/tmp/demo"));
        apply(&mut restored, &state);
        assert_eq!(restored.tasks.len(), 1);
        assert_eq!(restored.iteration, 4);
        assert_eq!(restored.completed_task_ids, vec!["#0"]);
    }

    #[test]
    fn test_seed_resets_interrupted_tasks_to_pending() {
        let mut session = Session::new("sess-1", PathBuf::from("/tmp/demo"));
        session.tasks = vec![task("#1"), task("#2")];
        session.tasks[0].status = TaskStatus::Completed;
        session.tasks[1].status = TaskStatus::InProgress;

        let state = seed(&session).unwrap();
        let seeded = tasks(&state);
        assert_eq!(seeded[0].status, TaskStatus::Completed);
        assert_eq!(seeded[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_missing_keys_default_cleanly() {
        let state = ExecutionState::new("e");
        assert!(tasks(&state).is_empty());
        assert!(completed_ids(&state).is_empty());
        assert_eq!(current_index(&state), None);
        assert_eq!(transcript(&state), None);
    }
}
