//! Checkpoint store writing one JSON file per label.
//!
//! The layout is `<dir>/<label>.json`, where `<dir>` is either a fixed
//! root with a subdirectory per execution id, or whatever a resolver
//! closure returns for the id -- typically a session's `checkpoints/`
//! directory, so snapshots land next to the rest of the session's files.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ratchet_core::checkpoint::{format_label, parse_label, CheckpointError, CheckpointStore};
use ratchet_types::execution::{CheckpointRecord, ExecutionState};
use tokio::sync::Mutex;

type DirResolver = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

enum Root {
    Fixed(PathBuf),
    Resolved(DirResolver),
}

pub struct DirCheckpointStore {
    root: Root,
    counters: DashMap<String, u32>,
    io_lock: Mutex<()>,
}

impl DirCheckpointStore {
    /// Store under `<root>/<execution_id>/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Root::Fixed(root.into()),
            counters: DashMap::new(),
            io_lock: Mutex::new(()),
        }
    }

    /// Store under whatever directory the resolver maps each execution id
    /// to. The resolver must be stable for a given id.
    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn(&str) -> PathBuf + Send + Sync + 'static,
    {
        Self {
            root: Root::Resolved(Arc::new(resolver)),
            counters: DashMap::new(),
            io_lock: Mutex::new(()),
        }
    }

    fn dir_for(&self, execution_id: &str) -> PathBuf {
        match &self.root {
            Root::Fixed(root) => root.join(execution_id),
            Root::Resolved(resolver) => resolver(execution_id),
        }
    }

    /// Every record in the directory, oldest first.
    async fn read_all(
        &self,
        execution_id: &str,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let dir = self.dir_for(execution_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            records.push(serde_json::from_slice::<CheckpointRecord>(&bytes)?);
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

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

impl CheckpointStore for DirCheckpointStore {
    async fn save(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        label: Option<&str>,
    ) -> Result<String, CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let records = self.read_all(execution_id).await?;
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

        let dir = self.dir_for(execution_id);
        tokio::fs::create_dir_all(&dir).await?;
        let record = CheckpointRecord::new(&label, state);
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(dir.join(format!("{label}.json")), bytes).await?;
        tracing::debug!(execution_id, label = label.as_str(), "checkpoint saved");
        Ok(label)
    }

    async fn load(&self, execution_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let records = self.read_all(execution_id).await?;
        Ok(records.into_iter().next_back())
    }

    async fn load_by_label(
        &self,
        execution_id: &str,
        label: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.dir_for(execution_id).join(format!("{label}.json"));
        let found = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(serde_json::from_slice::<CheckpointRecord>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if found.is_some()
            && let Some(n) = parse_label(label)
        {
            self.counters.insert(execution_id.to_string(), n);
        }
        Ok(found)
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<String>, CheckpointError> {
        let records = self.read_all(execution_id).await?;
        Ok(records.into_iter().map(|r| r.label).collect())
    }

    async fn delete(
        &self,
        execution_id: &str,
        label: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.io_lock.lock().await;
        let dir = self.dir_for(execution_id);
        let result = match label {
            Some(label) => tokio::fs::remove_file(dir.join(format!("{label}.json"))).await,
            None => {
                self.counters.remove(execution_id);
                tokio::fs::remove_dir_all(&dir).await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
