//! The session state machine: owns the lifecycle of a delegated work
//! session and drives its iteration graph.
//!
//! A session starts `Running`, iterates clear-context / select-task /
//! run-task / record until no task is ready, then finalizes. Cancellation
//! pauses; a node failure (including an agent launch failure) fails; a
//! truncated loop with ready work left pauses so a later `run` can pick it
//! back up. Every record step persists the session, so a crash at any point
//! resumes from durable state.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ratchet_types::error::StoreError;
use ratchet_types::execution::StateUpdate;
use ratchet_types::session::{Session, SessionStatus};
use ratchet_types::task::{normalize_id, Task, TaskStatus};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::engine::{EngineError, ExecutionEngine, ExecutionStatus};
use crate::graph::{
    loop_cap_key, CompiledGraph, ExecutionConfig, GraphBuilder, GraphError, LoopConfig,
    NodeError, NodeKind, NodeOutput, NodeSignal, NodeSpec,
};
use crate::session::ports::{
    AgentCallMeta, AgentCallRecord, CodingAgent, SessionStore, TaskVerdict, Verifier,
};
use crate::session::prompt;
use crate::session::state as session_state;
use crate::session::state::{
    KEY_CAPPED, KEY_COMPLETED, KEY_CURRENT_INDEX, KEY_DEADLOCKED, KEY_ITERATION,
    KEY_LAST_FAILURE, KEY_PROMPT, KEY_TRANSCRIPT, KEY_VERDICT,
};
use crate::taskgraph::{detect_deadlock, first_ready_index, Deadlock};

/// Loop id of the iteration body; its state keys use this prefix.
const LOOP_ID: &str = "iterate";

// ---------------------------------------------------------------------------
// Errors and config
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session record is corrupt: {0}")]
    Corrupt(String),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt(msg) => SessionError::Corrupt(msg),
            other => SessionError::Store(other),
        }
    }
}

/// Tunables for one machine instance.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cap on iteration-loop passes per `run` call. Hitting it with ready
    /// work left pauses the session rather than failing it.
    pub max_iterations: u32,
    pub execution: ExecutionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            execution: ExecutionConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

pub struct SessionMachine<S, A, V, C>
where
    S: SessionStore + 'static,
    A: CodingAgent + 'static,
    V: Verifier + 'static,
    C: CheckpointStore,
{
    store: Arc<S>,
    agent: Arc<A>,
    verifier: Arc<V>,
    engine: ExecutionEngine<C>,
    config: SessionConfig,
    cancels: DashMap<String, CancellationToken>,
}

impl<S, A, V, C> SessionMachine<S, A, V, C>
where
    S: SessionStore + 'static,
    A: CodingAgent + 'static,
    V: Verifier + 'static,
    C: CheckpointStore,
{
    pub fn new(store: S, agent: A, verifier: V, checkpoints: C) -> Self {
        Self {
            store: Arc::new(store),
            agent: Arc::new(agent),
            verifier: Arc::new(verifier),
            engine: ExecutionEngine::new(checkpoints),
            config: SessionConfig::default(),
            cancels: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create and persist a new session over the given task list.
    pub async fn init(
        &self,
        directory: PathBuf,
        tasks: Vec<Task>,
    ) -> Result<Session, SessionError> {
        let mut session = Session::new(Uuid::now_v7().to_string(), directory);
        session.tasks = tasks;
        self.store.save_session(&session).await?;
        self.store
            .append_progress(
                &session.session_id,
                &format!("session created with {} tasks", session.tasks.len()),
            )
            .await?;
        tracing::info!(
            session = session.session_id.as_str(),
            tasks = session.tasks.len(),
            "session created"
        );
        Ok(session)
    }

    /// Drive the session until it completes, fails, pauses, or is cancelled.
    /// Accepts a `Running` session (fresh or crash-recovered) or a `Paused`
    /// one, which it moves back to `Running` first.
    pub async fn run(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut session = self.load(session_id).await?;
        match session.status {
            SessionStatus::Running => {}
            SessionStatus::Paused => {
                session.status = SessionStatus::Running;
                self.store.save_session(&session).await?;
            }
            from @ (SessionStatus::Completed | SessionStatus::Failed) => {
                return Err(SessionError::InvalidTransition {
                    from,
                    to: SessionStatus::Running,
                });
            }
        }

        let graph = self.build_graph(&session)?;
        let state = session_state::seed(&session)
            .map_err(|e| SessionError::Corrupt(e.to_string()))?;

        let cancel = CancellationToken::new();
        self.cancels.insert(session.session_id.clone(), cancel.clone());
        let result = self.engine.execute_graph(&graph, state, cancel).await;
        self.cancels.remove(&session.session_id);
        let outcome = result?;

        session_state::apply(&mut session, &outcome.state);
        let next = match outcome.status {
            ExecutionStatus::Cancelled => SessionStatus::Paused,
            ExecutionStatus::Failed => SessionStatus::Failed,
            ExecutionStatus::Completed => {
                if outcome.state.get_bool(KEY_DEADLOCKED) {
                    SessionStatus::Failed
                } else if outcome.state.get_bool(KEY_CAPPED) {
                    SessionStatus::Paused
                } else {
                    SessionStatus::Completed
                }
            }
        };
        if session.status != next {
            if !session.status.can_transition_to(next) {
                return Err(SessionError::InvalidTransition {
                    from: session.status,
                    to: next,
                });
            }
            session.status = next;
        }
        self.store.save_session(&session).await?;

        let mut line = format!(
            "run finished: {next:?} after {} iterations",
            session.iteration
        );
        if let Some(error) = &outcome.error {
            line.push_str(&format!(" ({error})"));
        }
        self.store.append_progress(&session.session_id, &line).await?;
        tracing::info!(
            session = session.session_id.as_str(),
            status = ?next,
            iterations = session.iteration,
            "run finished"
        );
        Ok(session)
    }

    /// Resume a paused (or crash-interrupted) session. Resynchronizes the
    /// checkpoint label counter with durable history before any new saves,
    /// then continues from task selection; tasks already in a terminal
    /// status are never re-executed.
    pub async fn resume(&self, session_id: &str) -> Result<Session, SessionError> {
        let labels = self
            .engine
            .store()
            .list(session_id)
            .await
            .map_err(EngineError::from)?;
        if let Some(last) = labels.last() {
            self.engine
                .store()
                .load_by_label(session_id, last)
                .await
                .map_err(EngineError::from)?;
        }
        self.run(session_id).await
    }

    /// Request a pause of an in-flight run. Takes effect at the next step
    /// boundary. Returns false when no run is active for the id.
    pub fn pause(&self, session_id: &str) -> bool {
        match self.cancels.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        match self.store.load_session(session_id).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound) => Err(SessionError::NotFound(session_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Graph assembly
    // -----------------------------------------------------------------------

    fn build_graph(&self, session: &Session) -> Result<CompiledGraph, SessionError> {
        let until = |state: &ratchet_types::execution::ExecutionState| {
            first_ready_index(&session_state::tasks(state)).is_none()
        };
        let graph = GraphBuilder::new()
            .loop_(
                vec![
                    self.clear_context_node(),
                    self.select_task_node(session),
                    self.run_task_node(session),
                    self.record_node(session),
                ],
                LoopConfig::new(until)
                    .with_id(LOOP_ID)
                    .with_max_iterations(self.config.max_iterations),
            )
            .then(self.finalize_node())
            .end()
            .compile(self.config.execution.clone())?;
        Ok(graph)
    }

    /// Reset the per-iteration scratch keys so an attempt never sees the
    /// previous attempt's verdict. Runs at the head of every loop pass. The
    /// transcript is dropped unconditionally unless a context-window
    /// threshold is configured, in which case it survives until it outgrows
    /// the threshold.
    fn clear_context_node(&self) -> NodeSpec {
        NodeSpec::new("clear-context", NodeKind::Tool, |state, config| async move {
            let mut update = StateUpdate::new();
            let keep = config.context_window_threshold.is_some_and(|threshold| {
                session_state::transcript(&state).is_some_and(|t| t.len() <= threshold)
            });
            if !keep {
                update.insert(KEY_TRANSCRIPT.to_string(), json!(""));
            }
            update.insert(KEY_VERDICT.to_string(), Value::Null);
            update.insert(KEY_CURRENT_INDEX.to_string(), Value::Null);
            update.insert(KEY_PROMPT.to_string(), Value::Null);
            Ok(NodeOutput::update(update))
        })
    }

    /// Pick the first ready task (original order), mark it in progress, and
    /// persist the status change before any delegation -- or leave the loop
    /// when nothing can start.
    fn select_task_node(&self, session: &Session) -> NodeSpec {
        let store = Arc::clone(&self.store);
        let base = session.clone();

        NodeSpec::new("select-task", NodeKind::Decision, move |state, _config| {
            let store = Arc::clone(&store);
            let base = base.clone();
            async move {
                let mut tasks = session_state::tasks(&state);
                let Some(idx) = first_ready_index(&tasks) else {
                    tracing::debug!("no ready task, leaving iteration loop");
                    return Ok(NodeOutput::empty().with_signal(NodeSignal::LoopExit));
                };
                tasks[idx].status = TaskStatus::InProgress;
                tracing::info!(
                    task = tasks[idx].id.as_deref().unwrap_or("<unnamed>"),
                    "task selected"
                );

                let mut snapshot = base;
                snapshot.tasks = tasks.clone();
                snapshot.iteration = state.get_u64(KEY_ITERATION);
                snapshot.completed_task_ids = session_state::completed_ids(&state);
                snapshot.last_updated = chrono::Utc::now();
                store
                    .save_session(&snapshot)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))?;

                let mut update = StateUpdate::new();
                session_state::set_tasks(&mut update, &tasks)?;
                update.insert(KEY_CURRENT_INDEX.to_string(), json!(idx as u64));
                Ok(NodeOutput::update(update))
            }
        })
    }

    /// One agent attempt: build the prompt, call the agent, grade the
    /// transcript, and append the audit record. An agent failure is a node
    /// failure and fails the whole session.
    fn run_task_node(&self, session: &Session) -> NodeSpec {
        let agent = Arc::clone(&self.agent);
        let verifier = Arc::clone(&self.verifier);
        let store = Arc::clone(&self.store);
        let session_id = session.session_id.clone();

        NodeSpec::new("run-task", NodeKind::Agent, move |state, _config| {
            let agent = Arc::clone(&agent);
            let verifier = Arc::clone(&verifier);
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            async move {
                let tasks = session_state::tasks(&state);
                let idx = session_state::current_index(&state)
                    .ok_or_else(|| NodeError::new("no task selected"))?;
                let task = tasks
                    .get(idx)
                    .ok_or_else(|| NodeError::new("selected task index out of range"))?;

                let recovery = session_state::last_failure(&state);
                let completed = session_state::completed_ids(&state);
                let prompt_text = prompt::task_prompt(task, &tasks, &completed, recovery);

                let meta = AgentCallMeta {
                    session_id: session_id.clone(),
                    task_id: task.id.clone(),
                    iteration: state.get_u64(KEY_ITERATION),
                };
                let started = std::time::Instant::now();
                let reply = agent
                    .run(&prompt_text, &meta)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))?;
                let duration_ms = started.elapsed().as_millis() as u64;
                let verdict = verifier.verdict(&reply.transcript);

                store
                    .append_agent_call(
                        &session_id,
                        &AgentCallRecord::new(
                            &meta,
                            &prompt_text,
                            &reply.transcript,
                            verdict.clone(),
                            duration_ms,
                        ),
                    )
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))?;

                let mut update = StateUpdate::new();
                update.insert(KEY_TRANSCRIPT.to_string(), json!(reply.transcript));
                update.insert(KEY_PROMPT.to_string(), json!(prompt_text));
                update.insert(
                    KEY_VERDICT.to_string(),
                    serde_json::to_value(&verdict).map_err(|e| NodeError::new(e.to_string()))?,
                );
                Ok(NodeOutput::update(update))
            }
        })
    }

    /// Apply the verdict to the task list, advance the iteration counter,
    /// and persist the durable session snapshot.
    fn record_node(&self, session: &Session) -> NodeSpec {
        let store = Arc::clone(&self.store);
        let base = session.clone();

        NodeSpec::new("record", NodeKind::Tool, move |state, _config| {
            let store = Arc::clone(&store);
            let base = base.clone();
            async move {
                let mut tasks = session_state::tasks(&state);
                let idx = session_state::current_index(&state)
                    .ok_or_else(|| NodeError::new("no task selected"))?;
                if idx >= tasks.len() {
                    return Err(NodeError::new("selected task index out of range"));
                }
                let verdict: TaskVerdict = state
                    .get(KEY_VERDICT)
                    .cloned()
                    .ok_or_else(|| NodeError::new("no verdict recorded"))
                    .and_then(|v| {
                        serde_json::from_value(v).map_err(|e| NodeError::new(e.to_string()))
                    })?;

                let iteration = state.get_u64(KEY_ITERATION) + 1;
                let mut completed = session_state::completed_ids(&state);
                let mut update = StateUpdate::new();
                let line;

                match verdict {
                    TaskVerdict::Complete => {
                        tasks[idx].status = TaskStatus::Completed;
                        if let Some(id) = tasks[idx].id.clone() {
                            let norm = normalize_id(&id);
                            // Unblock everything that was waiting on it.
                            for t in &mut tasks {
                                t.blocked_by.retain(|b| normalize_id(b) != norm);
                            }
                            completed.push(norm);
                            line = format!("iteration {iteration}: completed task {id}");
                        } else {
                            line = format!("iteration {iteration}: completed unnamed task");
                        }
                        tracing::info!(iteration, "task completed");
                    }
                    TaskVerdict::Failed { reason } => {
                        let rem_id =
                            prompt::remediation_id(tasks[idx].id.as_deref(), iteration);
                        let rem = Task {
                            id: Some(rem_id.clone()),
                            content: prompt::remediation_content(&tasks[idx], &reason),
                            status: TaskStatus::Pending,
                            active_form: None,
                            blocked_by: vec![],
                        };
                        // Original retries once the remediation lands.
                        tasks[idx].status = TaskStatus::Pending;
                        tasks[idx].blocked_by.push(rem_id.clone());
                        tasks.insert(idx + 1, rem);
                        update.insert(KEY_LAST_FAILURE.to_string(), json!(reason));
                        line = format!(
                            "iteration {iteration}: task failed ({reason}), queued {rem_id}"
                        );
                        tracing::warn!(iteration, remediation = rem_id.as_str(), "task failed");
                    }
                }

                session_state::set_tasks(&mut update, &tasks)?;
                update.insert(KEY_ITERATION.to_string(), json!(iteration));
                update.insert(KEY_COMPLETED.to_string(), json!(completed));

                // Durable snapshot: a crash after this point resumes here.
                let mut snapshot = base;
                snapshot.tasks = tasks;
                snapshot.iteration = iteration;
                snapshot.completed_task_ids = completed;
                snapshot.last_updated = chrono::Utc::now();
                store
                    .save_session(&snapshot)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))?;
                store
                    .append_progress(&snapshot.session_id, &line)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))?;

                Ok(NodeOutput::update(update))
            }
        })
    }

    /// Decide how the run ends once the loop has exited: clean completion,
    /// a blocked task set, or a truncated loop with work still ready.
    fn finalize_node(&self) -> NodeSpec {
        NodeSpec::new("finalize", NodeKind::Decision, |state, _config| async move {
            let tasks = session_state::tasks(&state);
            let pending: Vec<&Task> = tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .collect();
            if pending.is_empty() {
                tracing::info!("all tasks complete");
                return Ok(NodeOutput::empty());
            }

            let mut update = StateUpdate::new();
            if first_ready_index(&tasks).is_some() {
                // The loop was truncated by its pass cap, not by exhaustion.
                debug_assert!(state.get_bool(&loop_cap_key(LOOP_ID)));
                tracing::info!(
                    remaining = pending.len(),
                    "iteration cap reached with ready work left"
                );
                update.insert(KEY_CAPPED.to_string(), json!(true));
                return Ok(NodeOutput::update(update));
            }

            // Nothing can start: diagnose why before failing.
            match detect_deadlock(&tasks) {
                Deadlock::Cycle { cycle } => {
                    tracing::warn!(cycle = ?cycle, "dependency cycle among remaining tasks");
                }
                Deadlock::ErrorDependency {
                    task_id,
                    error_dependencies,
                } => {
                    tracing::warn!(
                        task = task_id.as_str(),
                        errors = ?error_dependencies,
                        "task blocked on errored dependencies"
                    );
                }
                Deadlock::None => {}
            }
            for task in &pending {
                tracing::warn!(
                    task = task.id.as_deref().unwrap_or("<unnamed>"),
                    blocked_by = ?task.blocked_by,
                    "task cannot start"
                );
            }
            update.insert(KEY_DEADLOCKED.to_string(), json!(true));
            Ok(NodeOutput::update(update))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
