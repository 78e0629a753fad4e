//! Host command execution with a diagnostic trail.
//!
//! Every command the backends run on the host goes through [`CommandRunner`],
//! which records the last command line, the last error and the tail of the
//! output in a shared [`DiagnosticsLog`]. The log is what users see after a
//! failed start, whatever the cause.

use nodevm_core::error::{Result, VmError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Number of output lines kept for diagnostics.
pub const DIAGNOSTIC_LINES: usize = 20;

/// Snapshot of the diagnostic trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub last_command: Option<String>,
    pub last_error: Option<String>,
    pub log_lines: Vec<String>,
}

#[derive(Default)]
struct DiagnosticsInner {
    last_command: Option<String>,
    last_error: Option<String>,
    log_lines: VecDeque<String>,
}

/// Shared, append-only diagnostic trail.
#[derive(Clone, Default)]
pub struct DiagnosticsLog {
    inner: Arc<Mutex<DiagnosticsInner>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_command(&self, command: &str) {
        self.inner.lock().last_command = Some(command.to_string());
    }

    pub fn record_error(&self, error: &str) {
        self.inner.lock().last_error = Some(error.to_string());
    }

    /// Append output lines, keeping the last [`DIAGNOSTIC_LINES`].
    pub fn record_output(&self, output: &str) {
        let mut inner = self.inner.lock();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            if inner.log_lines.len() == DIAGNOSTIC_LINES {
                inner.log_lines.pop_front();
            }
            inner.log_lines.push_back(line.to_string());
        }
    }

    pub fn snapshot(&self) -> Diagnostics {
        let inner = self.inner.lock();
        Diagnostics {
            last_command: inner.last_command.clone(),
            last_error: inner.last_error.clone(),
            log_lines: inner.log_lines.iter().cloned().collect(),
        }
    }
}

/// Captured result of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs host commands, recording them in the diagnostic trail.
#[derive(Clone)]
pub struct CommandRunner {
    diagnostics: DiagnosticsLog,
    envs: Vec<(OsString, OsString)>,
}

impl CommandRunner {
    pub fn new(diagnostics: DiagnosticsLog) -> Self {
        Self {
            diagnostics,
            envs: Vec::new(),
        }
    }

    /// Return a runner that sets `key=value` for every command.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn diagnostics(&self) -> &DiagnosticsLog {
        &self.diagnostics
    }

    /// Run `program` to completion.
    ///
    /// With `expect_failure`, a non-zero exit is still an error but is only
    /// logged at debug level.
    pub async fn run(
        &self,
        program: &Path,
        args: &[&str],
        expect_failure: bool,
    ) -> Result<CommandOutput> {
        self.run_with_input(program, args, None, expect_failure)
            .await
    }

    /// Run `program`, feeding `input` on stdin.
    pub async fn run_with_input(
        &self,
        program: &Path,
        args: &[&str],
        input: Option<&str>,
        expect_failure: bool,
    ) -> Result<CommandOutput> {
        let rendered = command_line(program, args);
        self.diagnostics.record_command(&rendered);
        tracing::debug!(command = %rendered, "Running host command");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let error = VmError::Command {
                command: rendered.clone(),
                code: None,
                stderr: e.to_string(),
            };
            self.fail(&error, expect_failure);
            error
        })?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = decode(&output.stdout);
        let stderr = decode(&output.stderr);
        self.diagnostics.record_output(&stdout);
        self.diagnostics.record_output(&stderr);

        if !output.status.success() {
            let error = VmError::Command {
                command: rendered,
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            };
            self.fail(&error, expect_failure);
            return Err(error);
        }

        Ok(CommandOutput { stdout, stderr })
    }

    /// Start a long-lived process with inherited stdio closed.
    pub fn spawn(&self, program: &Path, args: &[&str]) -> Result<tokio::process::Child> {
        let rendered = command_line(program, args);
        self.diagnostics.record_command(&rendered);
        tracing::debug!(command = %rendered, "Spawning host process");

        tokio::process::Command::new(program)
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let error = VmError::Command {
                    command: rendered,
                    code: None,
                    stderr: e.to_string(),
                };
                self.fail(&error, false);
                error
            })
    }

    /// Expected failures (polling, capability probes) stay out of the
    /// diagnostics so they never mask the error that actually matters.
    fn fail(&self, error: &VmError, expect_failure: bool) {
        if expect_failure {
            tracing::debug!(error = %error, "Command failed (expected)");
        } else {
            self.diagnostics.record_error(&error.to_string());
            tracing::warn!(error = %error, "Command failed");
        }
    }
}

/// Lossy decode that also copes with the UTF-16LE output of `wsl.exe`.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "")
}

fn command_line(program: &Path, args: &[&str]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().map(|a| a.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}
