//! Core of the Ratchet iterate-until-done loop.
//!
//! This crate contains the "brain" of the system and the ports the
//! infrastructure layer implements:
//! - `taskgraph` -- pure scheduling algorithms: topological ordering,
//!   readiness, deadlock detection
//! - `graph` -- fluent start/then/loop/end builder and the compiled graph
//! - `engine` -- cooperative step engine with checkpointing and streaming
//! - `checkpoint` -- checkpoint store trait and the in-memory variant
//! - `session` -- the session state machine composing all of the above
//!
//! It depends only on `ratchet-types` -- never on filesystem or process I/O.

pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod session;
pub mod taskgraph;
