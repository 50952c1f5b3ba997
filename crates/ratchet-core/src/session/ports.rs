//! Ports the session machine drives: durable storage, the coding agent,
//! and transcript verification. Infrastructure crates provide the real
//! implementations; tests substitute in-memory ones.

use chrono::{DateTime, Utc};
use ratchet_types::error::StoreError;
use ratchet_types::session::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Agent call records
// ---------------------------------------------------------------------------

/// Context passed alongside a prompt, mostly for logging and audit.
#[derive(Debug, Clone)]
pub struct AgentCallMeta {
    pub session_id: String,
    pub task_id: Option<String>,
    pub iteration: u64,
}

/// What the agent produced for one prompt.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub transcript: String,
}

/// Did the transcript show the task finished?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskVerdict {
    Complete,
    Failed { reason: String },
}

/// One line of the per-session audit log. Non-authoritative: control flow
/// never reads these back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCallRecord {
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub iteration: u64,
    pub prompt: String,
    pub transcript: String,
    pub verdict: TaskVerdict,
    pub duration_ms: u64,
}

impl AgentCallRecord {
    pub fn new(
        meta: &AgentCallMeta,
        prompt: &str,
        transcript: &str,
        verdict: TaskVerdict,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: meta.task_id.clone(),
            iteration: meta.iteration,
            prompt: prompt.to_string(),
            transcript: transcript.to_string(),
            verdict,
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to launch agent: {0}")]
    Spawn(String),

    #[error("agent I/O error: {0}")]
    Io(String),

    #[error("agent exited abnormally: {0}")]
    Exited(String),
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Durable session persistence, keyed by session id.
pub trait SessionStore: Send + Sync {
    fn save_session(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Session, StoreError>> + Send;

    /// Append one human-readable line to the session's progress log.
    fn append_progress(
        &self,
        session_id: &str,
        line: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append one agent call to the session's audit log.
    fn append_agent_call(
        &self,
        session_id: &str,
        record: &AgentCallRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// The external coding assistant. One call per task attempt.
pub trait CodingAgent: Send + Sync {
    fn run(
        &self,
        prompt: &str,
        meta: &AgentCallMeta,
    ) -> impl Future<Output = Result<AgentReply, AgentError>> + Send;
}

/// Decides from a transcript whether a task attempt succeeded.
pub trait Verifier: Send + Sync {
    fn verdict(&self, transcript: &str) -> TaskVerdict;
}
