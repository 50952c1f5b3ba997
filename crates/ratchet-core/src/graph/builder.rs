//! Fluent graph builder and the compiled graph it produces.
//!
//! A graph is declared as `start(node).then(node)...loop_(body, cfg)...end()`
//! and compiled into a node table, an edge list, a start id, and a terminal
//! set. Loops are a dedicated construct: the body compiles into a chain plus
//! a synthetic controller node that counts passes and decides between
//! re-entering the body and exiting. Re-entry happens through the
//! controller's `goto`, never through a static back edge, which keeps the
//! compile-time acyclicity check a plain topological sort.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use ratchet_types::execution::{ExecutionState, StateUpdate};
use serde_json::json;
use thiserror::Error;

use super::node::{Edge, ExecutionConfig, NodeKind, NodeOutput, NodeSpec};

/// Terminal node id appended by `end()`.
pub const END: &str = "__end__";

/// Default pass cap for loops that do not configure one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural errors, rejected at compile time -- fatal before any execution.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph spec not closed with end()")]
    NotEnded,

    #[error("graph contains no nodes")]
    Empty,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("loop body must contain at least one node")]
    EmptyLoopBody,

    #[error("edge '{from}' -> '{to}' references an unknown node")]
    UnknownEdgeTarget { from: String, to: String },

    #[error("node '{0}' has no default edge")]
    MissingEdge(String),

    #[error("cycle detected involving node '{0}' (cycles are only legal via loop())")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Loop configuration
// ---------------------------------------------------------------------------

/// Exit predicate evaluated on the state after each full body pass.
pub type LoopPredicate = Arc<dyn Fn(&ExecutionState) -> bool + Send + Sync>;

/// Configuration of one loop construct.
#[derive(Clone)]
pub struct LoopConfig {
    /// Optional stable loop id; auto-assigned (`loop-N`) when absent.
    pub id: Option<String>,
    /// Loop exits when this returns true after a completed pass.
    pub until: LoopPredicate,
    /// Hard cap on completed passes; reaching it exits the loop and sets the
    /// cap flag in state, distinguishable from a predicate exit.
    pub max_iterations: u32,
}

impl LoopConfig {
    pub fn new<F>(until: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        Self {
            id: None,
            until: Arc::new(until),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

/// State key holding a loop's completed-pass count.
pub fn loop_iterations_key(loop_id: &str) -> String {
    format!("{loop_id}.iterations")
}

/// State key set to true when a loop exited by hitting its pass cap.
pub fn loop_cap_key(loop_id: &str) -> String {
    format!("{loop_id}.cap_reached")
}

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// Compile-time record of one loop: entry, controller, exit, and members.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub loop_id: String,
    /// First body node; the controller re-enters here.
    pub head: String,
    /// Synthetic decision node evaluated after each full pass.
    pub controller: String,
    /// Where control goes when the loop finishes.
    pub exit: String,
    /// Body node ids (excluding the controller).
    pub members: Vec<String>,
}

/// An executable graph: node table, edge list, start id, terminal set, loop
/// table, and execution config. Produced only by [`GraphBuilder::compile`],
/// so every instance is structurally valid.
pub struct CompiledGraph {
    nodes: HashMap<String, NodeSpec>,
    edges: Vec<Edge>,
    default_edges: HashMap<String, String>,
    start: String,
    terminals: HashSet<String>,
    loops: Vec<LoopInfo>,
    config: ExecutionConfig,
}

impl CompiledGraph {
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn default_edge(&self, id: &str) -> Option<&str> {
        self.default_edges.get(id).map(String::as_str)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminals.contains(id)
    }

    /// True when `id` names a node or a terminal -- a valid `goto` target.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id) || self.terminals.contains(id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// The exit node of the innermost loop containing `node_id`, if any.
    /// Used to route a `NodeSignal::LoopExit`.
    pub fn loop_exit_for(&self, node_id: &str) -> Option<&str> {
        self.loops
            .iter()
            .find(|info| info.members.iter().any(|m| m == node_id))
            .map(|info| info.exit.as_str())
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("start", &self.start)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("terminals", &self.terminals)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum BuildEntry {
    Node(NodeSpec),
    Loop { body: Vec<NodeSpec>, config: LoopConfig },
}

/// Fluent start/then/loop/end graph spec.
pub struct GraphBuilder {
    entries: Vec<BuildEntry>,
    ended: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Begin an empty graph; the first appended construct becomes the start.
    /// A graph may open directly with a loop, in which case execution begins
    /// at the loop's head.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            ended: false,
        }
    }

    /// Begin a graph at the given node.
    pub fn start(node: NodeSpec) -> Self {
        Self::new().then(node)
    }

    /// Append a node on the default path.
    #[must_use]
    pub fn then(mut self, node: NodeSpec) -> Self {
        self.entries.push(BuildEntry::Node(node));
        self
    }

    /// Append a loop whose body runs repeatedly until the predicate holds
    /// after a full pass or the pass cap is reached, whichever first.
    #[must_use]
    pub fn loop_(mut self, body: Vec<NodeSpec>, config: LoopConfig) -> Self {
        self.entries.push(BuildEntry::Loop { body, config });
        self
    }

    /// Close the graph with the terminal node.
    #[must_use]
    pub fn end(mut self) -> Self {
        self.ended = true;
        self
    }

    /// Compile into an executable graph, validating the structure.
    pub fn compile(self, config: ExecutionConfig) -> Result<CompiledGraph, GraphError> {
        if !self.ended {
            return Err(GraphError::NotEnded);
        }

        // First pass: the entry node id of every segment, so each segment
        // knows its successor during materialization.
        let mut entry_ids = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entry {
                BuildEntry::Node(spec) => entry_ids.push(spec.id.clone()),
                BuildEntry::Loop { body, .. } => entry_ids.push(
                    body.first()
                        .map(|n| n.id.clone())
                        .ok_or(GraphError::EmptyLoopBody)?,
                ),
            }
        }
        let Some(start) = entry_ids.first().cloned() else {
            return Err(GraphError::Empty);
        };

        // Second pass: materialize nodes, edges, and loop records now that
        // every segment's successor is known.
        let mut nodes: HashMap<String, NodeSpec> = HashMap::new();
        let mut edges: Vec<Edge> = Vec::new();
        let mut loops: Vec<LoopInfo> = Vec::new();
        let mut add_node = |spec: NodeSpec, nodes: &mut HashMap<String, NodeSpec>| {
            if nodes.contains_key(&spec.id) || spec.id == END {
                return Err(GraphError::DuplicateNode(spec.id));
            }
            nodes.insert(spec.id.clone(), spec);
            Ok(())
        };

        let mut loop_count = 0u32;
        for (i, entry) in self.entries.into_iter().enumerate() {
            let successor = entry_ids
                .get(i + 1)
                .cloned()
                .unwrap_or_else(|| END.to_string());
            match entry {
                BuildEntry::Node(spec) => {
                    edges.push(Edge {
                        from: spec.id.clone(),
                        to: successor,
                    });
                    add_node(spec, &mut nodes)?;
                }
                BuildEntry::Loop { body, config } => {
                    loop_count += 1;
                    let loop_id = config
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("loop-{loop_count}"));
                    let controller_id = format!("{loop_id}-check");
                    let head = body[0].id.clone();
                    let members: Vec<String> = body.iter().map(|n| n.id.clone()).collect();

                    // Chain body nodes; the last one feeds the controller.
                    for (j, spec) in body.into_iter().enumerate() {
                        let to = members
                            .get(j + 1)
                            .cloned()
                            .unwrap_or_else(|| controller_id.clone());
                        edges.push(Edge {
                            from: spec.id.clone(),
                            to,
                        });
                        add_node(spec, &mut nodes)?;
                    }

                    let controller = make_controller(
                        &controller_id,
                        &loop_id,
                        &head,
                        &successor,
                        &config,
                    );
                    edges.push(Edge {
                        from: controller_id.clone(),
                        to: successor.clone(),
                    });
                    add_node(controller, &mut nodes)?;

                    loops.push(LoopInfo {
                        loop_id,
                        head,
                        controller: controller_id,
                        exit: successor,
                        members,
                    });
                }
            }
        }

        let terminals: HashSet<String> = HashSet::from([END.to_string()]);

        // Validation: endpoints exist, defaults are total, statically acyclic.
        let mut default_edges = HashMap::new();
        for edge in &edges {
            if !nodes.contains_key(&edge.from) {
                return Err(GraphError::UnknownEdgeTarget {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            if !nodes.contains_key(&edge.to) && !terminals.contains(&edge.to) {
                return Err(GraphError::UnknownEdgeTarget {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            default_edges.insert(edge.from.clone(), edge.to.clone());
        }
        for id in nodes.keys() {
            if !default_edges.contains_key(id) {
                return Err(GraphError::MissingEdge(id.clone()));
            }
        }
        validate_acyclic(&nodes, &terminals, &edges)?;

        Ok(CompiledGraph {
            nodes,
            edges,
            default_edges,
            start,
            terminals,
            loops,
            config,
        })
    }
}

/// Synthesize a loop controller: counts completed passes, then exits on the
/// predicate or the pass cap (setting the cap flag), else re-enters the head.
fn make_controller(
    controller_id: &str,
    loop_id: &str,
    head: &str,
    exit: &str,
    config: &LoopConfig,
) -> NodeSpec {
    let until = Arc::clone(&config.until);
    let max_iterations = config.max_iterations;
    let head = head.to_string();
    let exit = exit.to_string();
    let iters_key = loop_iterations_key(loop_id);
    let cap_key = loop_cap_key(loop_id);
    let loop_id = loop_id.to_string();

    NodeSpec::new(controller_id, NodeKind::Decision, move |state, _config| {
        let until = Arc::clone(&until);
        let head = head.clone();
        let exit = exit.clone();
        let iters_key = iters_key.clone();
        let cap_key = cap_key.clone();
        let loop_id = loop_id.clone();
        async move {
            let completed = state.get_u64(&iters_key) + 1;
            let mut update = StateUpdate::new();
            update.insert(iters_key, json!(completed));

            if until(&state) {
                tracing::debug!(loop_id = loop_id.as_str(), completed, "loop predicate satisfied");
                return Ok(NodeOutput::update(update).with_goto(exit));
            }
            if completed >= u64::from(max_iterations) {
                tracing::debug!(loop_id = loop_id.as_str(), completed, "loop pass cap reached");
                update.insert(cap_key, json!(true));
                return Ok(NodeOutput::update(update).with_goto(exit));
            }
            Ok(NodeOutput::update(update).with_goto(head))
        }
    })
}

/// Topological sort over the static edge set -- any cycle here was not
/// produced by the loop construct and is a builder error.
fn validate_acyclic(
    nodes: &HashMap<String, NodeSpec>,
    terminals: &HashSet<String>,
    edges: &[Edge],
) -> Result<(), GraphError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for id in nodes.keys().map(String::as_str).chain(terminals.iter().map(String::as_str)) {
        indices.insert(id, graph.add_node(id));
    }
    for edge in edges {
        graph.add_edge(indices[edge.from.as_str()], indices[edge.to.as_str()], ());
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| GraphError::CycleDetected(graph[cycle.node_id()].to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
