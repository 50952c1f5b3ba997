//! Subprocess coding agent and the marker-based transcript verifier.
//!
//! The agent is any executable that reads a prompt on stdin and writes its
//! transcript to stdout. The verifier greps the transcript for the
//! completion markers the prompt asked for.

use std::path::PathBuf;
use std::time::Duration;

use ratchet_core::session::prompt::{MARKER_COMPLETE, MARKER_FAILED};
use ratchet_core::session::{AgentCallMeta, AgentError, AgentReply, CodingAgent, TaskVerdict, Verifier};
use tokio::io::AsyncWriteExt;

/// Default wall-clock limit per agent invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub struct ProcessAgent {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessAgent {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CodingAgent for ProcessAgent {
    async fn run(&self, prompt: &str, meta: &AgentCallMeta) -> Result<AgentReply, AgentError> {
        tracing::debug!(
            session = meta.session_id.as_str(),
            task = meta.task_id.as_deref().unwrap_or("<unnamed>"),
            iteration = meta.iteration,
            program = self.program.as_str(),
            "spawning agent"
        );

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {e}", self.program)))?;

        // Write the prompt, then drop stdin to signal EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Io(e.to_string()))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::Exited(format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| AgentError::Io(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Exited(format!(
                "status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(AgentReply {
            transcript: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// MarkerVerifier
// ---------------------------------------------------------------------------

/// Grades a transcript by its trailing completion markers. Absence of any
/// marker counts as a failure: an agent that silently stops did not finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerVerifier;

impl Verifier for MarkerVerifier {
    fn verdict(&self, transcript: &str) -> TaskVerdict {
        if transcript.lines().any(|l| l.trim() == MARKER_COMPLETE) {
            return TaskVerdict::Complete;
        }
        match transcript
            .lines()
            .rev()
            .find_map(|l| l.trim().strip_prefix(MARKER_FAILED))
        {
            Some(reason) => TaskVerdict::Failed {
                reason: reason.trim().to_string(),
            },
            None => TaskVerdict::Failed {
                reason: "transcript ended without a completion marker".to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
