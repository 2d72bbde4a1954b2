//! Local executable backend: JSON in on stdin, JSON out on stdout.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use moood_shared::{Entry, MooodError, Result, WorkerDescriptor};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{WORKER_NAME_ENV, WorkerBackend};

/// Runs a worker as a child process, one process per invocation.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }
}

#[async_trait]
impl WorkerBackend for CommandBackend {
    async fn call(&self, descriptor: &WorkerDescriptor, input: &Entry) -> Result<Value> {
        let worker = descriptor.name.as_str();
        let body = serde_json::to_vec(input)
            .map_err(|e| MooodError::invocation(worker, format!("failed to encode input: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&descriptor.runtime_parameters)
            .env(WORKER_NAME_ENV, worker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Abandoned invocations (timeouts, fail-fast) must not leave the child running
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(worker, program = %self.program, "spawning worker process");
        let mut child = command.spawn().map_err(|e| {
            MooodError::invocation(
                worker,
                format!("failed to spawn `{}`: {e}", self.program),
            )
        })?;

        // Feed stdin while stdout and stderr drain, so a worker that streams
        // output before consuming all of its input cannot fill the pipe and stall
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&body).await,
                None => Ok(()),
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());

        match written {
            Ok(()) => {}
            // The worker may exit without reading its input; its exit status decides
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => {
                return Err(MooodError::invocation(
                    worker,
                    format!("failed to write worker stdin: {e}"),
                ));
            }
        }

        let output =
            output.map_err(|e| MooodError::invocation(worker, format!("failed to wait for worker: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(worker, stderr = %stderr.trim(), "worker stderr");
        }

        if !output.status.success() {
            return Err(MooodError::invocation(
                worker,
                format!("{} ({})", output.status, tail(&stderr, 200)),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_payload(&stdout).ok_or_else(|| {
            MooodError::invocation(
                worker,
                format!("stdout is not a JSON value (got: {})", tail(&stdout, 200)),
            )
        })
    }

    fn kind(&self) -> &str {
        "command"
    }
}

/// The whole of stdout, or failing that its last non-empty line, so workers
/// may print diagnostics before the result.
fn parse_payload(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok().or_else(|| {
        trimmed
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
    })
}

fn tail(s: &str, max: usize) -> &str {
    let s = s.trim();
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
