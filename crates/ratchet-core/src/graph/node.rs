//! Node and edge vocabulary for compiled graphs.
//!
//! A node is an id, a display kind, and an async body. The kind is a closed
//! tagged enum used purely as a display hint -- the engine needs only the
//! uniform body capability, never the concrete kind. Bodies take the current
//! state plus the execution config and return a partial update, an optional
//! `goto` override, and an optional signal.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use ratchet_types::execution::{ExecutionState, StateUpdate};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kinds and edges
// ---------------------------------------------------------------------------

/// The kind of a node. Display hint only; dispatch is uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Tool,
    Agent,
    Decision,
    Wait,
}

/// A default transition, used whenever a node body returns no `goto`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// Signals and outputs
// ---------------------------------------------------------------------------

/// Out-of-band signal a node body may raise alongside its update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSignal {
    /// Leave the innermost enclosing loop, skipping the rest of the pass.
    LoopExit,
    /// End the whole execution as completed after this step's merge.
    Complete,
}

/// What a node body returns: a partial state update, an optional dynamic
/// transition overriding the default edge for this single step, and an
/// optional signal.
#[derive(Default)]
pub struct NodeOutput {
    pub update: StateUpdate,
    pub goto: Option<String>,
    pub signal: Option<NodeSignal>,
}

impl NodeOutput {
    /// No update, default transition.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Only a state update.
    pub fn update(update: StateUpdate) -> Self {
        Self {
            update,
            ..Self::default()
        }
    }

    /// Override the default edge for this step.
    #[must_use]
    pub fn with_goto(mut self, target: impl Into<String>) -> Self {
        self.goto = Some(target.into());
        self
    }

    /// Attach a signal.
    #[must_use]
    pub fn with_signal(mut self, signal: NodeSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Error raised by a node body. Captured by the engine: the execution halts
/// with status Failed and the most recent checkpoint stays valid.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NodeError(pub String);

impl NodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ---------------------------------------------------------------------------
// Bodies and specs
// ---------------------------------------------------------------------------

/// Boxed async node body: `(state, config) -> NodeOutput`.
pub type NodeBody = Arc<
    dyn Fn(ExecutionState, ExecutionConfig) -> BoxFuture<'static, Result<NodeOutput, NodeError>>
        + Send
        + Sync,
>;

/// A node as declared to the builder.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    pub body: NodeBody,
}

impl NodeSpec {
    /// Wrap an async closure as a node body.
    pub fn new<F, Fut>(id: impl Into<String>, kind: NodeKind, f: F) -> Self
    where
        F: Fn(ExecutionState, ExecutionConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            kind,
            body: Arc::new(move |state, config| Box::pin(f(state, config))),
        }
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

/// Engine policy attached to a compiled graph.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Persist the merged state after every step under an auto label.
    pub auto_checkpoint: bool,
    /// Optional context-window threshold (characters). A policy hook for the
    /// consuming layer, not an engine correctness requirement.
    pub context_window_threshold: Option<usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint: true,
            context_window_threshold: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
