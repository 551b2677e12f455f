//! Child-process execution with deadline and cancellation.
//!
//! Output is captured in full; a non-zero exit is data, not an error, so
//! the validator and healer can inspect stderr. Deadline overruns and
//! cancellations kill the child.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Captured output of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output for diagnosis; stderr first since compilers put
    /// errors there.
    pub fn collated(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stderr, self.stdout)
        }
    }
}

/// Run `command` in `working_dir`, killing it on deadline or cancellation.
pub async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, AgentError> {
    let parts = shlex::split(command)
        .ok_or_else(|| anyhow::anyhow!("unparseable command line: {command}"))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command line"))?;

    debug!(command, dir = %working_dir.display(), "running command");
    let started = Instant::now();

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        result = child.wait_with_output() => result?,
        _ = tokio::time::sleep(timeout) => {
            warn!(command, timeout_secs = timeout.as_secs(), "command timed out; killing");
            return Err(AgentError::Timeout {
                operation: format!("command `{command}`"),
                seconds: timeout.as_secs(),
            });
        }
        _ = cancel.cancelled() => {
            warn!(command, "command cancelled; killing");
            return Err(AgentError::Cancelled(format!("command `{command}`")));
        }
    };

    let result = CommandOutput {
        command: command.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
        duration_ms: started.elapsed().as_millis() as u64,
    };

    debug!(
        command,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "command finished"
    );
    Ok(result)
}
