//! Domain-specific error types for flashwright.
//!
//! This module defines `FlashwrightError`, a `thiserror`-based enum that
//! provides typed error variants for every failure mode the provisioning
//! engine distinguishes. Public API functions return
//! `Result<T, FlashwrightError>` for programmatic error handling, while
//! trait boundaries continue to use `anyhow::Result`.
//!
//! `FlashwrightError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.
//!
//! # Exit codes
//!
//! Every variant maps to a stable process exit code via
//! [`FlashwrightError::exit_code`]:
//!
//! | code | meaning                                      |
//! |------|----------------------------------------------|
//! | 0    | success                                      |
//! | 1    | unclassified error                           |
//! | 2    | recipe / validation error                    |
//! | 3    | device integrity self-test failure           |
//! | 4    | insufficient space for the selected products |
//! | 5    | artifact fetch failure                       |
//! | 6    | mount / unmount failure                      |
//! | 7    | external command failure                     |
//! | 8    | I/O error                                    |
//! | 9    | user abort                                   |

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message
/// directly (e.g., "I/O error: connection refused").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for flashwright.
///
/// Recipe-validation variants (`InvalidSizeFormat` through `Recipe`) are
/// raised before any hardware is touched. `DeviceIntegrity` aborts before the
/// partition table is modified. Everything after partitioning begins routes
/// through the orchestrator's rollback before reaching the caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FlashwrightError {
    /// A partition size string did not match the accepted format.
    #[error("invalid size format: {0:?} (allowed: bytes, or a number with kb/mb/gb/tb suffix)")]
    InvalidSizeFormat(String),

    /// Two partitions in a table share a name.
    #[error("partition name {0:?} is not unique within the table")]
    DuplicateName(String),

    /// A partition other than the last one requested the `max` size.
    #[error("only the last partition may use the max size (offending partition: {0:?})")]
    MisplacedMaxSize(String),

    /// A filesystem type has no formatting tool available on this host.
    #[error("filesystem type {fs_type:?} is not supported on this system ({tool} needed)")]
    UnsupportedFilesystem {
        /// The filesystem type from the recipe.
        fs_type: String,
        /// The mkfs tool that could not be found.
        tool: String,
    },

    /// A partition flag is not recognized by the partitioning backend.
    #[error("flag {flag:?} for partition {partition:?} is not valid")]
    InvalidFlag {
        /// The unrecognized flag.
        flag: String,
        /// The partition declaring it.
        partition: String,
    },

    /// The requested partition table format is not supported.
    #[error("partition table format {0:?} is not supported")]
    UnsupportedTableFormat(String),

    /// Any other recipe-shape violation (unknown attributes, missing
    /// documents, a product naming both a device and a command, ...).
    #[error("recipe error: {0}")]
    Recipe(String),

    /// The destructive pre-flight read/write self-test failed.
    #[error("device integrity check failed: first MiB of {device} did not read back correctly")]
    DeviceIntegrity {
        /// The device that failed the self-test.
        device: String,
    },

    /// A partition (or the device scratch budget) cannot hold the selected
    /// artifacts.
    #[error("not enough space on {slot}: short by {deficit} bytes")]
    InsufficientSpace {
        /// Human-readable budget slot ("device" or "partition N").
        slot: String,
        /// How many bytes over budget the selection is.
        deficit: u64,
    },

    /// An artifact could not be fetched (and the user declined to retry).
    #[error("artifact fetch failed: {0}")]
    ArtifactFetch(String),

    /// A device could not be mounted.
    #[error("failed to mount {device}: {detail}")]
    Mount {
        /// The device path that failed to mount.
        device: String,
        /// Failure detail from the mount command.
        detail: String,
    },

    /// One or more devices could not be unmounted.
    #[error("failed to unmount {count} device(s): {detail}")]
    Unmount {
        /// Number of devices that failed to unmount.
        count: usize,
        /// Joined per-device failure details.
        detail: String,
    },

    /// A command execution failed (non-zero exit, spawn failure, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason: exit code, signal, or internal error.
        status: String,
    },

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred (a path or an
        /// operation description with a path).
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },

    /// The user declined a confirmation or interrupted the run.
    #[error("aborted by user")]
    UserAbort,
}

impl FlashwrightError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Maps this error to its stable process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidSizeFormat(_)
            | Self::DuplicateName(_)
            | Self::MisplacedMaxSize(_)
            | Self::UnsupportedFilesystem { .. }
            | Self::InvalidFlag { .. }
            | Self::UnsupportedTableFormat(_)
            | Self::Recipe(_) => 2,
            Self::DeviceIntegrity { .. } => 3,
            Self::InsufficientSpace { .. } => 4,
            Self::ArtifactFetch(_) => 5,
            Self::Mount { .. } | Self::Unmount { .. } => 6,
            Self::Execution { .. } => 7,
            Self::Io { .. } => 8,
            Self::UserAbort => 9,
        }
    }
}
