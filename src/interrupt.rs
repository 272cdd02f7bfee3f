//! Cooperative interrupt handling and SIGINT deferral.
//!
//! The engine is strictly sequential; a Ctrl-C must not tear the process
//! down in the middle of a destructive step. Two mechanisms cover this:
//!
//! - [`install_interrupt_flag`] converts SIGINT into a process-wide flag that
//!   the orchestrator polls at its suspension points (between download
//!   retries, between product deliveries) and turns into the rollback path.
//! - [`DeferInterrupts`] is an RAII guard that ignores SIGINT entirely for
//!   the duration of a formatting subprocess, so a half-written filesystem is
//!   never left behind, and restores the previous disposition on drop.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::FlashwrightError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_signal: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT-to-flag handler for the rest of the process lifetime.
///
/// Call once from the top level before any destructive phase begins.
pub fn install_interrupt_flag() -> Result<(), FlashwrightError> {
    let action = SigAction::new(
        SigHandler::Handler(note_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.map_err(|e| {
        FlashwrightError::io(
            "failed to install SIGINT handler",
            std::io::Error::from_raw_os_error(e as i32),
        )
    })?;
    Ok(())
}

/// Returns true if a SIGINT has been received since the flag was installed
/// or last cleared.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Clears the interrupt flag (used when a run starts).
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Converts a pending interrupt into a `UserAbort` error.
///
/// The orchestrator calls this at every suspension point.
pub fn check_interrupt() -> Result<(), FlashwrightError> {
    if interrupted() {
        Err(FlashwrightError::UserAbort)
    } else {
        Ok(())
    }
}

/// RAII guard that ignores SIGINT until dropped.
///
/// Used around mkfs subprocess calls, where interrupting would leave a
/// half-written filesystem. The previous signal disposition is restored on
/// drop.
pub struct DeferInterrupts {
    previous: Option<SigAction>,
}

impl DeferInterrupts {
    /// Starts ignoring SIGINT, remembering the previous disposition.
    pub fn new() -> Result<Self, FlashwrightError> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let previous = unsafe { sigaction(Signal::SIGINT, &ignore) }.map_err(|e| {
            FlashwrightError::io(
                "failed to defer SIGINT",
                std::io::Error::from_raw_os_error(e as i32),
            )
        })?;
        Ok(Self {
            previous: Some(previous),
        })
    }
}

impl Drop for DeferInterrupts {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take()
            && let Err(e) = unsafe { sigaction(Signal::SIGINT, &previous) }
        {
            tracing::error!("failed to restore SIGINT disposition: {}", e);
        }
    }
}

/// Serializes tests that touch the process-wide interrupt flag.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
