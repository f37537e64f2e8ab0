//! External command execution.
//!
//! Mount, unmount and download go through [`ProcessRunner`] so the rest of the
//! crate never touches `tokio::process` directly and tests can script the
//! outcome of each command.

use std::{ffi::OsString, time::Duration};

use async_trait::async_trait;

use crate::error::FsError;

/// Collected result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a program with arguments and reports how it exited.
///
/// A non-zero exit is not an error at this layer; only failing to spawn or
/// wait for the process is.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, FsError>;
}

/// Runner backed by `tokio::process` with an upper bound on run time.
#[derive(Debug, Clone)]
pub struct TokioRunner {
    timeout: Duration,
}

impl TokioRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::util::config::DEFAULT_COMMAND_TIMEOUT_SECS))
    }
}

pub(crate) fn render_command(program: &str, args: &[OsString]) -> String {
    let mut line = program.to_string();
    for a in args {
        line.push(' ');
        line.push_str(&a.to_string_lossy());
    }
    line
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<ProcessOutput, FsError> {
        let command = render_command(program, args);
        tracing::debug!("exec: {command}");

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(res) => res.map_err(|source| FsError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(FsError::CommandTimeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
