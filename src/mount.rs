//! Session-scoped mount tracking.
//!
//! Every device the load phase mounts is recorded in a [`MountSession`], so
//! mounts are idempotent (one mount point per device, reused across
//! products) and both the success path and rollback can release everything
//! that was mounted. The `Drop` implementation is a last line of defense for
//! panics and early returns.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::FlashwrightError;
use crate::executor::{CommandExecutor, CommandSpec};

/// Tracks the devices mounted by one provisioning run.
pub struct MountSession {
    root: Utf8PathBuf,
    executor: Arc<dyn CommandExecutor>,
    /// (device, mount point) pairs in mount order.
    mounted: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl MountSession {
    /// Creates a session whose mount points live under a unique /tmp
    /// directory.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        let root = Utf8PathBuf::from(format!("/tmp/flashwright-{}", Uuid::new_v4()));
        Self::with_root(root, executor)
    }

    /// Creates a session rooted at an explicit directory (used by tests).
    pub fn with_root(root: Utf8PathBuf, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            root,
            executor,
            mounted: Vec::new(),
        }
    }

    /// Returns the mount point of a device if it is mounted this session.
    pub fn mount_point(&self, device: &Utf8Path) -> Option<&Utf8Path> {
        self.mounted
            .iter()
            .find(|(dev, _)| dev == device)
            .map(|(_, point)| point.as_path())
    }

    /// Returns true if nothing is currently mounted.
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    /// Mounts a device under the session root, reusing the existing mount
    /// point when the device was already mounted this session.
    pub fn mount(&mut self, device: &Utf8Path) -> Result<Utf8PathBuf> {
        if let Some(existing) = self.mount_point(device) {
            return Ok(existing.to_owned());
        }

        let name = device
            .file_name()
            .ok_or_else(|| FlashwrightError::Mount {
                device: device.to_string(),
                detail: "device path has no final component".to_string(),
            })?;
        let point = self.root.join(name);

        fs::create_dir_all(&point)
            .map_err(|e| FlashwrightError::io(format!("failed to create mount point: {}", point), e))?;

        info!("mounting {} on {}", device, point);
        let spec = CommandSpec::new("mount", [device.as_str(), point.as_str()]);
        let result = self.executor.execute(&spec)?;
        if !result.success() {
            let status = result
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FlashwrightError::Mount {
                device: device.to_string(),
                detail: status,
            }
            .into());
        }

        self.mounted.push((device.to_owned(), point.clone()));
        Ok(point)
    }

    /// Unmounts everything mounted this session, in reverse mount order.
    ///
    /// Best-effort: every device is attempted even when an earlier one
    /// fails, failures are collected into a single error, and devices that
    /// did unmount are forgotten so a retry only touches the stragglers.
    /// Calling this on an empty session is a no-op, so rollback after a
    /// completed unmount never double-unmounts.
    pub fn unmount_all(&mut self) -> Result<()> {
        if self.mounted.is_empty() {
            return Ok(());
        }

        info!("unmounting {} device(s)", self.mounted.len());

        let mut failures = Vec::new();
        let mut still_mounted = Vec::new();

        for (device, point) in self.mounted.drain(..).rev() {
            info!("unmounting {}", device);
            let spec = CommandSpec::new("umount", [device.as_str()]);
            match self.executor.execute(&spec) {
                Ok(result) if result.success() => {}
                Ok(result) => {
                    let status = result
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    failures.push(format!("umount {} failed: {}", device, status));
                    still_mounted.push((device, point));
                }
                Err(e) => {
                    failures.push(format!("umount {} failed: {}", device, e));
                    still_mounted.push((device, point));
                }
            }
        }

        still_mounted.reverse();
        self.mounted = still_mounted;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlashwrightError::Unmount {
                count: failures.len(),
                detail: failures.join("; "),
            }
            .into())
        }
    }

    /// Rollback path: sync filesystems, then best-effort unmount.
    ///
    /// Unmount failures are logged rather than raised so the error that
    /// triggered the rollback is the one the user sees.
    pub fn rollback(&mut self) {
        let sync = CommandSpec::new("sync", Vec::<String>::new());
        if let Err(e) = self.executor.execute(&sync) {
            error!("sync failed during rollback: {}", e);
        }
        if let Err(e) = self.unmount_all() {
            error!("failed to unmount during rollback: {}", e);
        }
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if !self.mounted.is_empty()
            && let Err(e) = self.unmount_all()
        {
            error!(
                "failed to unmount {} device(s) during cleanup: {}. \
                Manual cleanup may be required: findmnt | grep {}",
                self.mounted.len(),
                e,
                self.root
            );
        }
    }
}
