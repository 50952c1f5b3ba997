//! Graph vocabulary and compiler.
//!
//! - `node` -- the closed node/edge vocabulary: kinds, async bodies,
//!   outputs, signals, execution config
//! - `builder` -- the fluent start/then/loop/end builder and the compiled
//!   graph it produces

pub mod builder;
pub mod node;

pub use builder::{
    loop_cap_key, loop_iterations_key, CompiledGraph, GraphBuilder, GraphError, LoopConfig,
    LoopInfo, END,
};
pub use node::{
    Edge, ExecutionConfig, NodeBody, NodeError, NodeKind, NodeOutput, NodeSignal, NodeSpec,
};
