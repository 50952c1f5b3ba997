//! Execution state and checkpoint record types.
//!
//! `ExecutionState` is the free-form state object that flows through a graph
//! run: an outputs map keyed by string, to which composing layers add their
//! own domain fields. The engine never mutates a state in place; every step
//! produces a new state via [`ExecutionState::merge`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// A partial state update returned by a node body.
///
/// Keys present in the update overwrite the corresponding output; omitted
/// keys are retained unchanged.
pub type StateUpdate = HashMap<String, Value>;

/// The full state of one graph execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Unique id of this execution.
    pub execution_id: String,
    /// When the state was last replaced by a merge.
    pub last_updated: DateTime<Utc>,
    /// Free-form outputs map. Domain fields (task list, iteration, status)
    /// are added here by the composing layer under well-known keys.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

impl ExecutionState {
    /// Fresh empty state for an execution.
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            last_updated: Utc::now(),
            outputs: HashMap::new(),
        }
    }

    /// Produce a new state with `update` merged over the current outputs.
    ///
    /// Shallow merge: update keys overwrite, omitted keys are retained. The
    /// receiver is untouched; `last_updated` on the result is refreshed.
    #[must_use]
    pub fn merge(&self, update: StateUpdate) -> Self {
        let mut outputs = self.outputs.clone();
        outputs.extend(update);
        Self {
            execution_id: self.execution_id.clone(),
            last_updated: Utc::now(),
            outputs,
        }
    }

    /// Look up one output value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Convenience: output value as a bool, `false` when absent or not a bool.
    pub fn get_bool(&self, key: &str) -> bool {
        self.outputs.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Convenience: output value as a u64, `0` when absent or not a number.
    pub fn get_u64(&self, key: &str) -> u64 {
        self.outputs.get(key).and_then(Value::as_u64).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// CheckpointRecord
// ---------------------------------------------------------------------------

/// One durable, timestamped snapshot of an execution's state.
///
/// Records are append-only: many per execution id, addressed by a sequential
/// `node-NNN` label assigned at save time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Execution this snapshot belongs to.
    pub execution_id: String,
    /// Sequential label, e.g. "node-003".
    pub label: String,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Full state at the time of the save.
    pub state: ExecutionState,
}

impl CheckpointRecord {
    /// Snapshot the given state under a label, timestamped now.
    pub fn new(label: impl Into<String>, state: &ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id.clone(),
            label: label.into(),
            timestamp: Utc::now(),
            state: state.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_and_retains() {
        let mut state = ExecutionState::new("exec-1");
        state.outputs.insert("kept".to_string(), json!("old"));
        state.outputs.insert("replaced".to_string(), json!(1));

        let mut update = StateUpdate::new();
        update.insert("replaced".to_string(), json!(2));
        update.insert("added".to_string(), json!(true));

        let merged = state.merge(update);
        assert_eq!(merged.get("kept"), Some(&json!("old")));
        assert_eq!(merged.get("replaced"), Some(&json!(2)));
        assert_eq!(merged.get("added"), Some(&json!(true)));
        // Original untouched
        assert_eq!(state.get("replaced"), Some(&json!(1)));
        assert_eq!(state.get("added"), None);
    }

    #[test]
    fn test_empty_merge_retains_everything() {
        let mut state = ExecutionState::new("exec-1");
        state.outputs.insert("a".to_string(), json!([1, 2]));
        let merged = state.merge(StateUpdate::new());
        assert_eq!(merged.outputs, state.outputs);
    }

    #[test]
    fn test_typed_accessors() {
        let mut state = ExecutionState::new("exec-1");
        state.outputs.insert("flag".to_string(), json!(true));
        state.outputs.insert("count".to_string(), json!(7));
        assert!(state.get_bool("flag"));
        assert!(!state.get_bool("missing"));
        assert_eq!(state.get_u64("count"), 7);
        assert_eq!(state.get_u64("flag"), 0);
    }

    #[test]
    fn test_checkpoint_record_roundtrip() {
        let mut state = ExecutionState::new("exec-9");
        state.outputs.insert("iteration".to_string(), json!(3));
        let record = CheckpointRecord::new("node-003", &state);

        let json_str = serde_json::to_string(&record).unwrap();
        let parsed: CheckpointRecord = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.execution_id, "exec-9");
        assert_eq!(parsed.label, "node-003");
        assert_eq!(parsed.state.get_u64("iteration"), 3);
    }
}
