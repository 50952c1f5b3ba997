//! Prompt assembly for agent task attempts.
//!
//! Kept deliberately plain-text: the agent receives the task, the ids of
//! work already done, and any recovery context from a previous failed
//! attempt, then must end its transcript with a completion marker.

use ratchet_types::task::{normalize_id, Task, TaskStatus};

/// Transcript marker for a successful attempt.
pub const MARKER_COMPLETE: &str = "TASK COMPLETE";
/// Transcript marker prefix for a failed attempt; the rest of the line is
/// the failure reason.
pub const MARKER_FAILED: &str = "TASK FAILED:";

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Error => "error",
    }
}

/// Prompt for one task attempt. Recovery context rides along on every
/// delegation: the full current task list, the ids completed so far, and
/// the most recent failure reason when one exists.
pub fn task_prompt(
    task: &Task,
    tasks: &[Task],
    completed_ids: &[String],
    recovery: Option<&str>,
) -> String {
    let mut out = String::new();
    if let Some(id) = task.id.as_deref() {
        out.push_str(&format!("Task {id}: {}\n", task.content));
    } else {
        out.push_str(&format!("Task: {}\n", task.content));
    }
    if !tasks.is_empty() {
        out.push_str("Current task list:\n");
        for t in tasks {
            out.push_str(&format!(
                "- {} ({}): {}\n",
                t.id.as_deref().unwrap_or("-"),
                status_label(t.status),
                t.content
            ));
        }
    }
    if !completed_ids.is_empty() {
        out.push_str(&format!(
            "Already completed: {}\n",
            completed_ids.join(", ")
        ));
    }
    if let Some(context) = recovery {
        out.push_str("Most recent failure:\n");
        out.push_str(context);
        out.push('\n');
    }
    out.push_str(&format!(
        "When done, print '{MARKER_COMPLETE}' on its own line. \
         If the task cannot be completed, print '{MARKER_FAILED} <reason>'.\n"
    ));
    out
}

/// Deterministic id for a remediation task inserted after a failed attempt.
/// `iteration` disambiguates repeated failures of the same task.
pub fn remediation_id(original_id: Option<&str>, iteration: u64) -> String {
    match original_id {
        Some(id) => format!("fix-{}-{iteration}", normalize_id(id)),
        None => format!("fix-task-{iteration}"),
    }
}

/// Content for a remediation task.
pub fn remediation_content(original: &Task, reason: &str) -> String {
    match original.id.as_deref() {
        Some(id) => format!(
            "Investigate and fix the failure from task {id}: {reason}. \
             Original task: {}",
            original.content
        ),
        None => format!(
            "Investigate and fix the failure: {reason}. Original task: {}",
            original.content
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use ratchet_types::task::TaskStatus;

    use super::*;

    fn task(id: Option<&str>, content: &str) -> Task {
        Task {
            id: id.map(str::to_string),
            content: content.to_string(),
            status: TaskStatus::Pending,
            active_form: None,
            blocked_by: vec![],
        }
    }

    #[test]
    fn test_prompt_mentions_task_and_markers() {
        let p = task_prompt(&task(Some("#1"), "add CI"), &[], &[], None);
        assert!(p.contains("Task #1: add CI"));
        assert!(p.contains(MARKER_COMPLETE));
        assert!(p.contains(MARKER_FAILED));
        assert!(!p.contains("Already completed"));
        assert!(!p.contains("Current task list"));
    }

    #[test]
    fn test_prompt_lists_every_task_with_status() {
        let mut done = task(Some("#1"), "bootstrap");
        done.status = TaskStatus::Completed;
        let tasks = vec![done, task(Some("#2"), "wire the parser")];
        let p = task_prompt(&tasks[1], &tasks, &["1".to_string()], None);
        assert!(p.contains("- #1 (completed): bootstrap"));
        assert!(p.contains("- #2 (pending): wire the parser"));
    }

    #[test]
    fn test_prompt_includes_completed_and_recovery() {
        let current = task(Some("#3"), "ship it");
        let tasks = vec![current.clone()];
        let p = task_prompt(
            &current,
            &tasks,
            &["#1".to_string(), "#2".to_string()],
            Some("tests failed on step 2"),
        );
        assert!(p.contains("Already completed: #1, #2"));
        assert!(p.contains("Most recent failure:\ntests failed on step 2"));
    }

    #[test]
    fn test_remediation_id_forms() {
        assert_eq!(remediation_id(Some("#7"), 3), "fix-7-3");
        assert_eq!(remediation_id(Some("##7"), 3), "fix-#7-3");
        assert_eq!(remediation_id(None, 3), "fix-task-3");
    }
}
