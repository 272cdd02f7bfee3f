//! Real command executor implementation.
//!
//! [`RealCommandExecutor`] resolves commands via `which`, runs them with
//! `std::process::Command`, and streams stdout/stderr lines to `tracing`
//! while the command runs so mkfs and parted progress stays visible.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};
use which::which;

use super::{CapturedOutput, CommandExecutor, CommandSpec, ExecutionResult};
use crate::error::FlashwrightError;

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, commands are logged but not executed, and both
/// operations return results with `status: None`.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

/// Reads a pipe line by line and logs each line as it arrives.
///
/// stdout is logged at INFO, stderr at WARN, so tool progress is visible at
/// the default log level. I/O errors stop reading but do not fail command
/// execution; success is determined by exit status alone.
fn stream_pipe_to_log<R: Read>(pipe: Option<R>, stderr: bool) {
    let Some(pipe) = pipe else {
        return;
    };

    let mut reader = BufReader::new(pipe);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line_buf);
                let trimmed = text.trim_end_matches(['\n', '\r']);
                if stderr {
                    tracing::warn!("{}", trimmed);
                } else {
                    tracing::info!("{}", trimmed);
                }
            }
            Err(e) => {
                tracing::error!("I/O error while reading command output, stopping: {}", e);
                break;
            }
        }
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run {
            tracing::info!("dry run: {}", spec.display_line());
            return Ok(ExecutionResult { status: None });
        }

        let cmd =
            which(&spec.command).with_context(|| format!("command not found: {}", spec.command))?;
        tracing::trace!("command found: {}: {}", spec.command, cmd.to_string_lossy());

        let mut child = Command::new(cmd)
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn command: {}", spec.display_line()))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // The scope joins both reader threads before wait() returns.
        let status = thread::scope(|scope| {
            scope.spawn(|| stream_pipe_to_log(stdout_pipe, false));
            scope.spawn(|| stream_pipe_to_log(stderr_pipe, true));
            child.wait()
        })
        .map_err(|e| FlashwrightError::Execution {
            command: spec.display_line(),
            status: format!("failed to wait for command: {}", e),
        })?;

        tracing::trace!("executed command: {}: success={}", spec.command, status.success());

        Ok(ExecutionResult {
            status: Some(status),
        })
    }

    fn capture(&self, spec: &CommandSpec) -> Result<CapturedOutput> {
        if self.dry_run {
            tracing::info!("dry run (capture): {}", spec.display_line());
            return Ok(CapturedOutput {
                status: None,
                stdout: String::new(),
            });
        }

        let cmd =
            which(&spec.command).with_context(|| format!("command not found: {}", spec.command))?;

        let output = Command::new(cmd)
            .args(&spec.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run command: {}", spec.display_line()))?;

        if !output.stderr.is_empty() {
            tracing::debug!(
                command = %spec.command,
                "stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        Ok(CapturedOutput {
            status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
