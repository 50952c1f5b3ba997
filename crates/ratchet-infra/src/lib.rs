//! Infrastructure implementations for Ratchet.
//!
//! Everything that touches the filesystem or spawns processes lives here:
//! - `checkpoint` -- file- and directory-backed checkpoint stores
//! - `session_fs` -- the durable per-session directory layout
//! - `agent` -- the subprocess coding agent and transcript verifier
//! - `telemetry` -- tracing subscriber setup

pub mod agent;
pub mod checkpoint;
pub mod session_fs;
pub mod telemetry;
