//! Command execution abstraction for flashwright.
//!
//! Every external tool the engine drives (`parted`, the mkfs family,
//! `mount`/`umount`, `blkid`, `udevadm`, `sync`) goes through the
//! [`CommandExecutor`] trait so tests can substitute a recording mock and
//! destructive operations never run against a developer machine.
//!
//! Two execution modes exist: [`CommandExecutor::execute`] streams output to
//! the log in real time (mkfs progress, parted warnings), while
//! [`CommandExecutor::capture`] collects stdout for tools whose output is
//! consumed programmatically (`blkid -o value`, `openssl passwd`).

mod real;

use std::process::ExitStatus;

use anyhow::Result;

pub use real::RealCommandExecutor;

/// Formats string arguments into a space-separated, debug-quoted string.
///
/// Used by error messages to consistently format command arguments
/// (e.g., `"-F32" "-n" "BOOT" "/dev/mmcblk0p1"`).
pub(crate) fn format_command_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("{:?}", a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Specification for a command to be executed.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The command to execute (e.g., "parted").
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a new CommandSpec with command and args.
    #[must_use]
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders the spec as a single display line for logs and errors.
    pub fn display_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, format_command_args(&self.args))
        }
    }
}

/// Result of command execution.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit status of the command (None in dry-run mode).
    pub status: Option<ExitStatus>,
}

impl ExecutionResult {
    /// Returns true if the command executed successfully.
    ///
    /// In dry-run mode (status is None), this always returns true.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns the exit code if available.
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Result of command execution with captured stdout.
#[derive(Debug)]
pub struct CapturedOutput {
    /// Exit status of the command (None in dry-run mode).
    pub status: Option<ExitStatus>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
}

impl CapturedOutput {
    /// Returns true if the command executed successfully.
    pub fn success(&self) -> bool {
        self.status.is_none_or(|s| s.success())
    }

    /// Returns the trimmed stdout as a single value.
    pub fn value(&self) -> &str {
        self.stdout.trim()
    }
}

/// Trait for command execution.
///
/// Implementations must be `Send + Sync` so the executor can be shared as
/// `Arc<dyn CommandExecutor>` while reader threads stream subprocess output.
pub trait CommandExecutor: Send + Sync {
    /// Executes a command, streaming its output to the log.
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult>;

    /// Executes a command, capturing its stdout.
    fn capture(&self, spec: &CommandSpec) -> Result<CapturedOutput>;
}
