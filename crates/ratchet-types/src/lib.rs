//! Shared domain types for Ratchet.
//!
//! This crate contains the types that flow between the scheduler, the graph
//! engine, and the persistence layer: Task, Session, ExecutionState,
//! CheckpointRecord, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod error;
pub mod execution;
pub mod session;
pub mod task;
