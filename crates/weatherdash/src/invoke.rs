//! Bounded external process invocation.
//!
//! A call spawns the executable with all three stdio handles piped, writes
//! an optional JSON request to stdin, collects stdout/stderr while the
//! child runs and enforces a hard wall-clock timeout. Exactly one
//! [`InvocationError`] variant (or success) is produced per call.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};

/// Captured stderr/stdout longer than this is truncated in error messages.
const MAX_MESSAGE_CHARS: usize = 2000;

/// What to run and how long to allow it.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Short name used in log lines and errors
    pub name: String,
    /// Executable path or name resolved via PATH
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Hard wall-clock limit, measured from spawn
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(name: impl Into<String>, executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout,
        }
    }

    /// Build from a command line such as `python3 scripts/fetch.py --flag`.
    ///
    /// Splits on whitespace; returns `None` for an empty command.
    pub fn from_command_line(
        name: impl Into<String>,
        command: &str,
        timeout: Duration,
    ) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let executable = parts.next()?;
        Some(Self::new(name, executable, timeout).with_args(parts))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Raw result of a process that exited on its own.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Diagnostic text for a failed run: stderr, or stdout when stderr is empty.
    pub fn failure_message(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        truncate(text)
    }
}

/// Errors from a process invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{name}' timed out after {}ms and was killed", timeout.as_millis())]
    Timeout { name: String, timeout: Duration },

    #[error("'{name}' exited with {}: {message}", describe_code(*code))]
    ProcessFailed {
        name: String,
        code: Option<i32>,
        message: String,
    },

    #[error("'{name}' produced invalid output: {detail}")]
    ContractViolation { name: String, detail: String },
}

impl InvocationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvocationError::Timeout { .. })
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "no exit code (signal)".to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

/// Run the process and parse its stdout as JSON into `T`.
pub async fn invoke<T, P>(invocation: &Invocation, stdin: Option<&P>) -> Result<T, InvocationError>
where
    T: DeserializeOwned,
    P: Serialize + ?Sized,
{
    let output = invoke_raw(invocation, stdin).await?;
    if !output.success() {
        return Err(InvocationError::ProcessFailed {
            name: invocation.name.clone(),
            code: output.code,
            message: output.failure_message(),
        });
    }
    parse_output(&invocation.name, &output.stdout)
}

/// Parse a successful run's stdout.
pub fn parse_output<T: DeserializeOwned>(name: &str, stdout: &str) -> Result<T, InvocationError> {
    if stdout.trim().is_empty() {
        return Err(InvocationError::ContractViolation {
            name: name.to_string(),
            detail: "empty stdout".to_string(),
        });
    }
    serde_json::from_str(stdout.trim()).map_err(|e| InvocationError::ContractViolation {
        name: name.to_string(),
        detail: e.to_string(),
    })
}

/// Run the process and return whatever it printed, without judging the exit code.
///
/// Only spawn failures and timeouts are errors here.
pub async fn invoke_raw<P>(
    invocation: &Invocation,
    stdin: Option<&P>,
) -> Result<ProcessOutput, InvocationError>
where
    P: Serialize + ?Sized,
{
    let payload = match stdin {
        Some(p) => Some(serde_json::to_vec(p).map_err(|e| {
            InvocationError::ContractViolation {
                name: invocation.name.clone(),
                detail: format!("request could not be encoded: {}", e),
            }
        })?),
        None => None,
    };

    log::debug!(
        "[Invoke] [{}] spawning: {} {}",
        invocation.name,
        invocation.executable,
        invocation.args.join(" ")
    );

    let mut cmd = Command::new(&invocation.executable);
    cmd.args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &invocation.working_dir {
        cmd.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        log::error!("[Invoke] [{}] failed to spawn: {}", invocation.name, e);
        InvocationError::Spawn {
            name: invocation.name.clone(),
            source: e,
        }
    })?;

    // Readers start before stdin is written so a chatty child never blocks
    // on a full pipe while we are still feeding it.
    let stdout_task = child.stdout.take().map(spawn_reader);
    let stderr_task = child.stderr.take().map(spawn_reader);

    let stdin_task = child.stdin.take().map(|mut pipe| {
        let name = invocation.name.clone();
        tokio::spawn(async move {
            if let Some(bytes) = payload {
                if let Err(e) = pipe.write_all(&bytes).await {
                    log::debug!("[Invoke] [{}] stdin write failed: {}", name, e);
                    return;
                }
            }
            if let Err(e) = pipe.shutdown().await {
                log::debug!("[Invoke] [{}] stdin close failed: {}", name, e);
            }
            // Dropping the pipe closes the child's stdin.
        })
    });

    // One deadline covers the exit and the pipe drains: a grandchild that
    // inherited stdout can hold the pipe open after the child is gone.
    let deadline = tokio::time::Instant::now() + invocation.timeout;
    let aborts: Vec<AbortHandle> = stdin_task
        .iter()
        .map(JoinHandle::abort_handle)
        .chain(stdout_task.iter().map(JoinHandle::abort_handle))
        .chain(stderr_task.iter().map(JoinHandle::abort_handle))
        .collect();

    let run = async {
        let status = child.wait().await;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        (status, stdout, stderr)
    };

    let (status, stdout, stderr) = match tokio::time::timeout_at(deadline, run).await {
        Ok((status, stdout, stderr)) => {
            let status = status.map_err(|e| InvocationError::Spawn {
                name: invocation.name.clone(),
                source: e,
            })?;
            (status, stdout, stderr)
        }
        Err(_) => {
            log::warn!(
                "[Invoke] [{}] exceeded {}ms, killing",
                invocation.name,
                invocation.timeout.as_millis()
            );
            // Fails harmlessly when the child already exited.
            if let Err(e) = child.start_kill() {
                log::debug!("[Invoke] [{}] kill: {}", invocation.name, e);
            }
            for task in &aborts {
                task.abort();
            }
            return Err(InvocationError::Timeout {
                name: invocation.name.clone(),
                timeout: invocation.timeout,
            });
        }
    };

    let elapsed = started.elapsed();

    log::debug!(
        "[Invoke] [{}] exited with {:?} after {}ms",
        invocation.name,
        status.code(),
        elapsed.as_millis()
    );

    Ok(ProcessOutput {
        code: status.code(),
        stdout,
        stderr,
        elapsed,
    })
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        // A read error just ends collection; whatever arrived is kept.
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => match handle.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}
