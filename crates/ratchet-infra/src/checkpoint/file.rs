//! Checkpoint store keeping one JSON file per execution.
//!
//! `<root>/<execution_id>.json` holds every record of that execution in
//! save order, so it mirrors the in-memory store's semantics exactly while
//! surviving restarts. Label counters live in memory and are re-derived
//! from the file's parseable labels after a restart.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use ratchet_core::checkpoint::{format_label, parse_label, CheckpointError, CheckpointStore};
use ratchet_types::execution::{CheckpointRecord, ExecutionState};
use tokio::sync::Mutex;

pub struct FileCheckpointStore {
    root: PathBuf,
    counters: DashMap<String, u32>,
    // Serializes read-modify-write cycles on the backing files.
    io_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: DashMap::new(),
            io_lock: Mutex::new(()),
        }
    }

    fn path(&self, execution_id: &str) -> PathBuf {
        self.root.join(format!("{execution_id}.json"))
    }

    async fn read_records(path: &Path) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_records(
        &self,
        path: &Path,
        records: &[CheckpointRecord],
    ) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Current counter for an execution, re-derived from the file when this
    /// process has not touched the execution yet.
    fn counter_seed(&self, execution_id: &str, records: &[CheckpointRecord]) -> u32 {
        if let Some(c) = self.counters.get(execution_id) {
            return *c;
        }
        records
            .iter()
            .filter_map(|r| parse_label(&r.label))
            .max()
            .unwrap_or(0)
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        label: Option<&str>,
    ) -> Result<String, CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let path = self.path(execution_id);
        let mut records = Self::read_records(&path).await?;
        let mut counter = self.counter_seed(execution_id, &records);

        let label = match label {
            Some(explicit) => {
                if let Some(n) = parse_label(explicit) {
                    counter = counter.max(n);
                }
                explicit.to_string()
            }
            None => {
                counter += 1;
                format_label(counter)
            }
        };
        self.counters.insert(execution_id.to_string(), counter);

        records.push(CheckpointRecord::new(&label, state));
        self.write_records(&path, &records).await?;
        tracing::debug!(execution_id, label = label.as_str(), "checkpoint saved");
        Ok(label)
    }

    async fn load(&self, execution_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let records = Self::read_records(&self.path(execution_id)).await?;
        Ok(records.into_iter().next_back())
    }

    async fn load_by_label(
        &self,
        execution_id: &str,
        label: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let records = Self::read_records(&self.path(execution_id)).await?;
        let found = records.into_iter().find(|r| r.label == label);
        if found.is_some()
            && let Some(n) = parse_label(label)
        {
            self.counters.insert(execution_id.to_string(), n);
        }
        Ok(found)
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<String>, CheckpointError> {
        let records = Self::read_records(&self.path(execution_id)).await?;
        Ok(records.into_iter().map(|r| r.label).collect())
    }

    async fn delete(
        &self,
        execution_id: &str,
        label: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let path = self.path(execution_id);
        match label {
            Some(label) => {
                let mut records = Self::read_records(&path).await?;
                records.retain(|r| r.label != label);
                self.write_records(&path, &records).await?;
            }
            None => {
                self.counters.remove(execution_id);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
