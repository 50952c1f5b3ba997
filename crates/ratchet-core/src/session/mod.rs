//! Session lifecycle over the iteration graph.
//!
//! - `ports` -- storage, agent, and verifier seams
//! - `state` -- well-known execution-state keys and typed accessors
//! - `prompt` -- prompt assembly and remediation naming
//! - `machine` -- the state machine driving init/run/pause/resume

pub mod machine;
pub mod ports;
pub mod prompt;
pub mod state;

pub use machine::{SessionConfig, SessionError, SessionMachine};
pub use ports::{
    AgentCallMeta, AgentCallRecord, AgentError, AgentReply, CodingAgent, SessionStore,
    TaskVerdict, Verifier,
};
