//! Durable per-session directory layout.
//!
//! Every session owns `<root>/<session_id>/` with:
//! - `session.json`   -- the full session record
//! - `tasks.json`     -- the task list alone, for quick inspection
//! - `progress.txt`   -- append-only human-readable progress lines
//! - `logs/agent-calls.jsonl` -- one JSON object per agent invocation
//! - `checkpoints/`   -- execution snapshots (written by the dir store)

use std::path::{Path, PathBuf};

use ratchet_core::session::{AgentCallRecord, SessionStore};
use ratchet_types::error::StoreError;
use ratchet_types::session::Session;
use tokio::io::AsyncWriteExt;

pub struct FsSessionStore {
    root: PathBuf,
}

impl FsSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Where the directory checkpoint store should put this session's
    /// snapshots. Hand this to `DirCheckpointStore::with_resolver`.
    pub fn checkpoint_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("checkpoints")
    }

    async fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

impl SessionStore for FsSessionStore {
    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let dir = self.session_dir(&session.session_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(
            dir.join("session.json"),
            serde_json::to_vec_pretty(session)?,
        )
        .await?;
        tokio::fs::write(
            dir.join("tasks.json"),
            serde_json::to_vec_pretty(&session.tasks)?,
        )
        .await?;
        tracing::debug!(
            session = session.session_id.as_str(),
            dir = %dir.display(),
            "session persisted"
        );
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let path = self.session_dir(session_id).join("session.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }

    async fn append_progress(&self, session_id: &str, line: &str) -> Result<(), StoreError> {
        let path = self.session_dir(session_id).join("progress.txt");
        Self::append_line(&path, line).await
    }

    async fn append_agent_call(
        &self,
        session_id: &str,
        record: &AgentCallRecord,
    ) -> Result<(), StoreError> {
        let path = self
            .session_dir(session_id)
            .join("logs")
            .join("agent-calls.jsonl");
        Self::append_line(&path, &serde_json::to_string(record)?).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use ratchet_core::session::{AgentCallMeta, TaskVerdict};
    use ratchet_types::task::{Task, TaskStatus};
    use tempfile::TempDir;

    use super::*;

    fn session(id: &str, dir: &Path) -> Session {
        let mut s = Session::new(id, dir.to_path_buf());
        s.tasks = vec![Task {
            id: Some("#1".to_string()),
            content: "do the thing".to_string(),
            status: TaskStatus::Pending,
            active_form: None,
            blocked_by: vec![],
        }];
        s
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = FsSessionStore::new(tmp.path());
        let s = session("sess-1", tmp.path());
        store.save_session(&s).await.unwrap();

        let loaded = store.load_session("sess-1").await.unwrap();
        assert_eq!(loaded.session_id, "sess-1");
        assert_eq!(loaded.tasks.len(), 1);
        assert!(tmp.path().join("sess-1/tasks.json").exists());
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FsSessionStore::new(tmp.path());
        assert!(matches!(
            store.load_session("ghost").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn corrupt_session_file_is_reported_not_reset() {
        let tmp = TempDir::new().unwrap();
        let store = FsSessionStore::new(tmp.path());
        let dir = tmp.path().join("sess-1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("session.json"), b"{ not json")
            .await
            .unwrap();

        assert!(matches!(
            store.load_session("sess-1").await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn progress_lines_accumulate() {
        let tmp = TempDir::new().unwrap();
        let store = FsSessionStore::new(tmp.path());
        store.append_progress("sess-1", "first").await.unwrap();
        store.append_progress("sess-1", "second").await.unwrap();

        let text = tokio::fs::read_to_string(tmp.path().join("sess-1/progress.txt"))
            .await
            .unwrap();
        assert_eq!(text, "first\nsecond\n");
    }

    /// Whole loop against the real filesystem layout: subprocess agent,
    /// marker verifier, per-session checkpoint directory.
    #[cfg(unix)]
    #[tokio::test]
    async fn full_session_loop_produces_durable_layout() {
        use ratchet_core::session::SessionMachine;
        use ratchet_types::session::SessionStatus;

        use crate::agent::{MarkerVerifier, ProcessAgent};
        use crate::checkpoint::DirCheckpointStore;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let resolver_root = root.clone();
        let machine = SessionMachine::new(
            FsSessionStore::new(&root),
            ProcessAgent::new("sh").with_args(["-c", "cat >/dev/null; echo 'TASK COMPLETE'"]),
            MarkerVerifier,
            DirCheckpointStore::with_resolver(move |id| {
                resolver_root.join(id).join("checkpoints")
            }),
        );

        let tasks = vec![
            Task {
                id: Some("#2".to_string()),
                content: "second".to_string(),
                status: TaskStatus::Pending,
                active_form: None,
                blocked_by: vec!["#1".to_string()],
            },
            Task {
                id: Some("#1".to_string()),
                content: "first".to_string(),
                status: TaskStatus::Pending,
                active_form: None,
                blocked_by: vec![],
            },
        ];
        let session = machine.init(root.clone(), tasks).await.unwrap();
        let done = machine.run(&session.session_id).await.unwrap();

        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.completed_task_ids, vec!["1", "2"]);

        let dir = root.join(&done.session_id);
        for file in ["session.json", "tasks.json", "progress.txt", "logs/agent-calls.jsonl"] {
            assert!(dir.join(file).exists(), "missing {file}");
        }
        let mut checkpoints = std::fs::read_dir(dir.join("checkpoints"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        checkpoints.sort();
        assert_eq!(checkpoints.first().map(String::as_str), Some("node-001.json"));
    }

    #[tokio::test]
    async fn agent_calls_append_as_jsonl() {
        let tmp = TempDir::new().unwrap();
        let store = FsSessionStore::new(tmp.path());
        let meta = AgentCallMeta {
            session_id: "sess-1".to_string(),
            task_id: Some("#1".to_string()),
            iteration: 0,
        };
        let record = AgentCallRecord::new(
            &meta,
            "prompt text",
            "transcript text",
            TaskVerdict::Complete,
            42,
        );
        store.append_agent_call("sess-1", &record).await.unwrap();
        store.append_agent_call("sess-1", &record).await.unwrap();

        let text =
            tokio::fs::read_to_string(tmp.path().join("sess-1/logs/agent-calls.jsonl"))
                .await
                .unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AgentCallRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.task_id.as_deref(), Some("#1"));
    }
}
