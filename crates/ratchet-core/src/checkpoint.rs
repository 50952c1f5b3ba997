//! Checkpoint store: durable, labelled snapshots of execution state.
//!
//! A store keeps an append-only sequence of [`CheckpointRecord`]s per
//! execution id, addressed by a sequential fixed-width label (`node-003`).
//! Lookups for unknown execution ids or labels return `None`/empty, never an
//! error. The label counter is per-process: resuming from durable history
//! must resynchronize it via [`CheckpointStore::load_by_label`] before
//! further saves.
//!
//! This module defines the port and the in-process variant; the file- and
//! directory-backed variants live in `ratchet-infra`.

use std::collections::HashMap;
use std::sync::Mutex;

use ratchet_types::execution::{CheckpointRecord, ExecutionState};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Render a sequence number as a checkpoint label ("node-003").
pub fn format_label(n: u32) -> String {
    format!("node-{n:03}")
}

/// Parse a checkpoint label back into its sequence number.
pub fn parse_label(label: &str) -> Option<u32> {
    label.strip_prefix("node-")?.parse().ok()
}

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Errors from checkpoint persistence.
///
/// Missing records are not errors; only the storage medium itself failing
/// surfaces here.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(String),

    #[error("checkpoint serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serde(e.to_string())
    }
}

/// Save/load/list/delete of execution-state snapshots.
///
/// Uses RPITIT for async methods; consumers stay generic over the store
/// (`ExecutionEngine<C: CheckpointStore>`), so both in-memory and durable
/// variants plug in without boxing.
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot. When `label` is omitted the next sequential
    /// auto-label is assigned. Returns the label used. Concurrent saves for
    /// one execution id serialize through the counter -- never overwritten.
    fn save(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        label: Option<&str>,
    ) -> impl Future<Output = Result<String, CheckpointError>> + Send;

    /// Most recent snapshot for an execution, or `None`.
    fn load(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, CheckpointError>> + Send;

    /// A specific snapshot by label, or `None`. On a hit, resynchronizes the
    /// internal counter so subsequent auto-labels continue from it.
    fn load_by_label(
        &self,
        execution_id: &str,
        label: &str,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, CheckpointError>> + Send;

    /// Labels in save order; empty for an unknown execution id.
    fn list(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, CheckpointError>> + Send;

    /// Remove one record (by label) or every record for the execution id.
    /// Removing something that does not exist is a no-op.
    fn delete(
        &self,
        execution_id: &str,
        label: Option<&str>,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Vec<CheckpointRecord>>,
    counters: HashMap<String, u32>,
}

/// In-process checkpoint store for tests and non-durable runs.
///
/// Label assignment and record insertion happen under one lock, so
/// concurrent saves for the same execution id get distinct sequential
/// labels.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        label: Option<&str>,
    ) -> Result<String, CheckpointError> {
        let mut inner = self.inner.lock().expect("checkpoint lock poisoned");
        let counter = inner.counters.entry(execution_id.to_string()).or_insert(0);
        let label = match label {
            Some(explicit) => {
                if let Some(n) = parse_label(explicit) {
                    *counter = (*counter).max(n);
                }
                explicit.to_string()
            }
            None => {
                *counter += 1;
                format_label(*counter)
            }
        };

        let record = CheckpointRecord::new(&label, state);
        inner
            .records
            .entry(execution_id.to_string())
            .or_default()
            .push(record);
        tracing::debug!(execution_id, label = label.as_str(), "checkpoint saved");
        Ok(label)
    }

    async fn load(&self, execution_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let inner = self.inner.lock().expect("checkpoint lock poisoned");
        Ok(inner
            .records
            .get(execution_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn load_by_label(
        &self,
        execution_id: &str,
        label: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let mut inner = self.inner.lock().expect("checkpoint lock poisoned");
        let found = inner
            .records
            .get(execution_id)
            .and_then(|records| records.iter().find(|r| r.label == label).cloned());
        if found.is_some()
            && let Some(n) = parse_label(label)
        {
            inner.counters.insert(execution_id.to_string(), n);
        }
        Ok(found)
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<String>, CheckpointError> {
        let inner = self.inner.lock().expect("checkpoint lock poisoned");
        Ok(inner
            .records
            .get(execution_id)
            .map(|records| records.iter().map(|r| r.label.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete(
        &self,
        execution_id: &str,
        label: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock().expect("checkpoint lock poisoned");
        match label {
            Some(label) => {
                if let Some(records) = inner.records.get_mut(execution_id) {
                    records.retain(|r| r.label != label);
                }
            }
            None => {
                inner.records.remove(execution_id);
                inner.counters.remove(execution_id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
