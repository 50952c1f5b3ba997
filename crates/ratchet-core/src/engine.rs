//! Step-wise execution of a compiled graph.
//!
//! The engine owns no domain logic: it walks a [`CompiledGraph`] one node at
//! a time, merges each node's update into the state, checkpoints after every
//! step, and resolves the next node from the node's own output (signal, then
//! goto, then default edge). Node-body failures end the run with a `Failed`
//! outcome; only structural problems (an unknown transition target, a
//! checkpoint store fault) surface as hard errors.

use async_stream::try_stream;
use futures_util::Stream;
use ratchet_types::execution::ExecutionState;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::graph::{CompiledGraph, NodeSignal};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Structural runtime errors. Node-body failures are not errors here; they
/// produce a `Failed` [`ExecutionOutcome`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transition target '{0}' is not in the graph")]
    UnknownTarget(String),

    #[error("node '{0}' signalled a loop exit outside any loop")]
    LoopExitOutsideLoop(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// A terminal was reached, or a node signalled completion.
    Completed,
    /// The cancellation token fired between steps. The state is consistent
    /// as of the last completed step and the run can be resumed from it.
    Cancelled,
    /// A node body returned an error.
    Failed,
}

/// Result of a full run: final status, the state as of the last completed
/// step, the label of the last checkpoint written (if any), and the node
/// error when the run failed.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub state: ExecutionState,
    pub snapshot: Option<String>,
    pub error: Option<String>,
}

/// One entry of the step stream: the node that ran (or was about to run,
/// for `Cancelled`) and the state after its merge.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub node_id: String,
    pub status: ExecutionStatus,
    pub state: ExecutionState,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives a compiled graph against a checkpoint store.
pub struct ExecutionEngine<C: CheckpointStore> {
    store: C,
}

impl<C: CheckpointStore> ExecutionEngine<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Run the graph to completion, cancellation, or failure.
    pub async fn execute_graph(
        &self,
        graph: &CompiledGraph,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut cursor = Cursor::new(graph, state);
        loop {
            match cursor.advance(&self.store, &cancel).await? {
                Step::Ran(_) => {}
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Run the graph, yielding an event after every step. The stream ends
    /// after a terminal, a completion signal, a failure, or cancellation;
    /// the last event's status tells which.
    pub fn stream_graph<'a>(
        &'a self,
        graph: &'a CompiledGraph,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<StepEvent, EngineError>> + 'a {
        try_stream! {
            let mut cursor = Cursor::new(graph, state);
            loop {
                match cursor.advance(&self.store, &cancel).await? {
                    Step::Ran(event) => yield event,
                    Step::Done(outcome) => {
                        // A normal completion was already covered by the last
                        // step event; failure and cancellation get a final one.
                        if outcome.status != ExecutionStatus::Completed {
                            yield StepEvent {
                                node_id: cursor
                                    .last_node
                                    .clone()
                                    .unwrap_or_else(|| cursor.current.clone()),
                                status: outcome.status,
                                state: outcome.state,
                            };
                        }
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step loop
// ---------------------------------------------------------------------------

enum Step {
    Ran(StepEvent),
    Done(ExecutionOutcome),
}

/// Walk position shared by the run and stream entry points.
struct Cursor<'g> {
    graph: &'g CompiledGraph,
    current: String,
    state: ExecutionState,
    snapshot: Option<String>,
    /// Id of the most recently executed node, for final stream events.
    last_node: Option<String>,
}

impl<'g> Cursor<'g> {
    fn new(graph: &'g CompiledGraph, state: ExecutionState) -> Self {
        Self {
            graph,
            current: graph.start().to_string(),
            state,
            snapshot: None,
            last_node: None,
        }
    }

    /// Execute one step: cancel check, node body, merge, checkpoint, next.
    async fn advance<C: CheckpointStore>(
        &mut self,
        store: &C,
        cancel: &CancellationToken,
    ) -> Result<Step, EngineError> {
        if self.graph.is_terminal(&self.current) {
            return Ok(Step::Done(self.outcome(ExecutionStatus::Completed, None)));
        }
        if cancel.is_cancelled() {
            tracing::info!(node = self.current.as_str(), "execution cancelled");
            return Ok(Step::Done(self.outcome(ExecutionStatus::Cancelled, None)));
        }

        let node = self
            .graph
            .node(&self.current)
            .ok_or_else(|| EngineError::UnknownTarget(self.current.clone()))?;

        tracing::debug!(node = node.id.as_str(), kind = ?node.kind, "executing node");
        let output = match (node.body)(self.state.clone(), self.graph.config().clone()).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(node = node.id.as_str(), error = %e, "node failed");
                return Ok(Step::Done(
                    self.outcome(ExecutionStatus::Failed, Some(e.to_string())),
                ));
            }
        };

        self.state = self.state.merge(output.update);
        if self.graph.config().auto_checkpoint {
            let label = store.save(&self.state.execution_id, &self.state, None).await?;
            self.snapshot = Some(label);
        }
        let ran = self.current.clone();
        self.last_node = Some(ran.clone());

        // Transition precedence: signal, then goto, then the default edge.
        let next = match output.signal {
            Some(NodeSignal::Complete) => {
                return Ok(Step::Done(self.outcome(ExecutionStatus::Completed, None)));
            }
            Some(NodeSignal::LoopExit) => self
                .graph
                .loop_exit_for(&ran)
                .map(str::to_string)
                .ok_or(EngineError::LoopExitOutsideLoop(ran.clone()))?,
            None => match output.goto {
                Some(target) => target,
                None => self
                    .graph
                    .default_edge(&ran)
                    .map(str::to_string)
                    .ok_or_else(|| EngineError::UnknownTarget(ran.clone()))?,
            },
        };
        if !self.graph.contains(&next) {
            return Err(EngineError::UnknownTarget(next));
        }
        self.current = next;

        Ok(Step::Ran(StepEvent {
            node_id: ran,
            status: ExecutionStatus::Completed,
            state: self.state.clone(),
        }))
    }

    fn outcome(&self, status: ExecutionStatus, error: Option<String>) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            state: self.state.clone(),
            snapshot: self.snapshot.clone(),
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::{
        ExecutionConfig, GraphBuilder, LoopConfig, NodeError, NodeKind, NodeOutput, NodeSpec,
    };

    fn engine() -> ExecutionEngine<MemoryCheckpointStore> {
        ExecutionEngine::new(MemoryCheckpointStore::new())
    }

    fn set(id: &str, key: &'static str, value: serde_json::Value) -> NodeSpec {
        NodeSpec::new(id, NodeKind::Tool, move |_state, _config| {
            let value = value.clone();
            async move {
                Ok(NodeOutput::update(HashMap::from([(
                    key.to_string(),
                    value,
                )])))
            }
        })
    }

    fn counter(id: &str, key: &'static str) -> NodeSpec {
        NodeSpec::new(id, NodeKind::Tool, move |state, _config| async move {
            let n = state.get_u64(key) + 1;
            Ok(NodeOutput::update(HashMap::from([(
                key.to_string(),
                json!(n),
            )])))
        })
    }

    // -----------------------------------------------------------------------
    // Run to completion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_run_completes_and_checkpoints() {
        let graph = GraphBuilder::start(set("a", "a.done", json!(true)))
            .then(set("b", "b.done", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();
        let engine = engine();

        let outcome = engine
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert!(outcome.state.get_bool("a.done"));
        assert!(outcome.state.get_bool("b.done"));
        assert_eq!(outcome.snapshot.as_deref(), Some("node-002"));
        let labels = engine.store().list("exec-1").await.unwrap();
        assert_eq!(labels, vec!["node-001", "node-002"]);
    }

    #[tokio::test]
    async fn test_loop_runs_until_predicate() {
        let graph = GraphBuilder::start(set("init", "started", json!(true)))
            .loop_(
                vec![counter("work", "count")],
                LoopConfig::new(|state: &ExecutionState| state.get_u64("count") >= 3)
                    .with_id("lp"),
            )
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.state.get_u64("count"), 3);
        assert_eq!(outcome.state.get_u64("lp.iterations"), 3);
        assert!(!outcome.state.get_bool("lp.cap_reached"));
    }

    #[tokio::test]
    async fn test_loop_cap_exit_marks_state() {
        let graph = GraphBuilder::start(counter("seed", "seen"))
            .loop_(
                vec![counter("work", "count")],
                LoopConfig::new(|_| false).with_id("lp").with_max_iterations(2),
            )
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        // The run still completes; the cap flag records the truncated exit.
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.state.get_u64("count"), 2);
        assert!(outcome.state.get_bool("lp.cap_reached"));
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_complete_signal_halts_early() {
        let halt = NodeSpec::new("halt", NodeKind::Decision, |_state, _config| async {
            Ok(NodeOutput::update(HashMap::from([(
                "halted".to_string(),
                json!(true),
            )]))
            .with_signal(crate::graph::NodeSignal::Complete))
        });
        let graph = GraphBuilder::start(halt)
            .then(set("never", "never.ran", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert!(outcome.state.get_bool("halted"));
        assert!(!outcome.state.get_bool("never.ran"));
    }

    #[tokio::test]
    async fn test_loop_exit_signal_skips_rest_of_pass() {
        let bail = NodeSpec::new("bail", NodeKind::Decision, |_state, _config| async {
            Ok(NodeOutput::empty().with_signal(crate::graph::NodeSignal::LoopExit))
        });
        let graph = GraphBuilder::start(set("init", "started", json!(true)))
            .loop_(
                vec![bail, counter("work", "count")],
                LoopConfig::new(|_| false).with_id("lp"),
            )
            .then(set("after", "after.ran", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        // Neither the rest of the body nor the controller ran.
        assert_eq!(outcome.state.get_u64("count"), 0);
        assert_eq!(outcome.state.get_u64("lp.iterations"), 0);
        assert!(outcome.state.get_bool("after.ran"));
    }

    #[tokio::test]
    async fn test_loop_exit_outside_loop_is_an_error() {
        let bail = NodeSpec::new("bail", NodeKind::Decision, |_state, _config| async {
            Ok(NodeOutput::empty().with_signal(crate::graph::NodeSignal::LoopExit))
        });
        let graph = GraphBuilder::start(bail)
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let err = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LoopExitOutsideLoop(id) if id == "bail"));
    }

    // -----------------------------------------------------------------------
    // Failure and cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_node_failure_yields_failed_outcome() {
        let boom = NodeSpec::new("boom", NodeKind::Tool, |_state, _config| async {
            Err::<NodeOutput, _>(NodeError::new("disk on fire"))
        });
        let graph = GraphBuilder::start(set("ok", "ok.ran", json!(true)))
            .then(boom)
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();
        let engine = engine();

        let outcome = engine
            .execute_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("disk on fire"));
        // The snapshot is from the last successful step and holds exactly
        // the state that preceded the failing node.
        assert_eq!(outcome.snapshot.as_deref(), Some("node-001"));
        assert!(outcome.state.get_bool("ok.ran"));
        let record = engine
            .store()
            .load_by_label("exec-1", "node-001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state.outputs, outcome.state.outputs);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_runs_nothing() {
        let graph = GraphBuilder::start(set("a", "a.ran", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert!(!outcome.state.get_bool("a.ran"));
        assert!(outcome.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_cancel_between_steps_keeps_completed_work() {
        let cancel = CancellationToken::new();
        let trip = {
            let cancel = cancel.clone();
            NodeSpec::new("trip", NodeKind::Tool, move |_state, _config| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    Ok(NodeOutput::update(HashMap::from([(
                        "trip.ran".to_string(),
                        json!(true),
                    )])))
                }
            })
        };
        let graph = GraphBuilder::start(trip)
            .then(set("after", "after.ran", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();

        let outcome = engine()
            .execute_graph(&graph, ExecutionState::new("exec-1"), cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert!(outcome.state.get_bool("trip.ran"));
        assert!(!outcome.state.get_bool("after.ran"));
        // The step that did complete was checkpointed; resume starts there.
        assert_eq!(outcome.snapshot.as_deref(), Some("node-001"));
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_stream_yields_every_step_in_order() {
        let graph = GraphBuilder::start(set("a", "a.ran", json!(true)))
            .then(set("b", "b.ran", json!(true)))
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();
        let engine = engine();

        let events: Vec<_> = engine
            .stream_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let ids: Vec<_> = events.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(events.last().unwrap().status, ExecutionStatus::Completed);
        // Intermediate events carry the state as of that step.
        assert!(!events[0].state.get_bool("b.ran"));
        assert!(events[1].state.get_bool("b.ran"));
    }

    #[tokio::test]
    async fn test_stream_surfaces_failure_event() {
        let boom = NodeSpec::new("boom", NodeKind::Tool, |_state, _config| async {
            Err::<NodeOutput, _>(NodeError::new("nope"))
        });
        let graph = GraphBuilder::start(boom)
            .end()
            .compile(ExecutionConfig::default())
            .unwrap();
        let engine = engine();

        let events: Vec<_> = engine
            .stream_graph(&graph, ExecutionState::new("exec-1"), CancellationToken::new())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ExecutionStatus::Failed);
        assert_eq!(events[0].node_id, "boom");
    }
}
