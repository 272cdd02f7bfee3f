//! Destructive block-device operations.
//!
//! Everything in this module is irreversible: the integrity self-test
//! overwrites the first MiB of the device, `apply_layout` replaces the
//! partition table, and `format_partitions` runs mkfs over every new
//! partition. The deployment orchestrator only calls in here after the user
//! confirmed the layout.

use camino::{Utf8Path, Utf8PathBuf};
use rand::RngCore;
use rand::rngs::OsRng;
use rustix::fs::{Mode, OFlags};
use tracing::{debug, info, warn};

use crate::error::FlashwrightError;
use crate::executor::{CommandExecutor, CommandSpec};
use crate::interrupt::DeferInterrupts;
use crate::planner::ResolvedLayout;
use crate::recipe::FsType;
use crate::sysfs;

const TEST_REGION: usize = 1024 * 1024;

/// A partition as it exists on the device after the table is committed.
#[derive(Debug, Clone)]
pub struct ResolvedPartition {
    /// /dev node of the partition.
    pub path: Utf8PathBuf,
    /// Label applied at format time (the recipe's partition name).
    pub label: String,
    /// Filesystem the partition was formatted with.
    pub fs_type: FsType,
    /// Filesystem UUID, when `blkid` could read one.
    pub uuid: Option<String>,
}

/// Applies resolved layouts to physical devices.
pub struct PartitionExecutor<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> PartitionExecutor<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// Runs the full destructive sequence: self-test, partition table,
    /// formatting. Returns the concrete partitions for mounting and fstab
    /// generation.
    pub fn execute(
        &self,
        device: &Utf8Path,
        layout: &ResolvedLayout,
    ) -> anyhow::Result<Vec<ResolvedPartition>> {
        integrity_check(device)?;
        self.apply_layout(device, layout)?;
        self.settle();
        self.format_partitions(device, layout)
    }

    /// Replaces the partition table and carves the planned partitions.
    pub fn apply_layout(&self, device: &Utf8Path, layout: &ResolvedLayout) -> anyhow::Result<()> {
        info!("deleting existing partitions from {}", device);
        info!("creating {} partition table on {}", layout.table, device);
        let table = layout.table.to_string();
        self.run(CommandSpec::new(
            "parted",
            ["-s", device.as_str(), "mklabel", table.as_str()],
        ))?;

        for (index, part) in layout.partitions.iter().enumerate() {
            let end_sector = part.start_sector + part.sector_count - 1;
            // On gpt the mkpart name argument becomes the partition name;
            // msdos has no names and takes the partition type instead.
            let name_arg = if layout.table.supports_partition_names() {
                part.name.as_str()
            } else {
                "primary"
            };

            info!(
                "creating partition {} ({}, sectors {}..{})",
                part.name, part.fs_type, part.start_sector, end_sector
            );
            let start = format!("{}s", part.start_sector);
            let end = format!("{}s", end_sector);
            self.run(CommandSpec::new(
                "parted",
                [
                    "-s",
                    device.as_str(),
                    "unit",
                    "s",
                    "mkpart",
                    name_arg,
                    part.fs_type.parted_name(),
                    start.as_str(),
                    end.as_str(),
                ],
            ))?;

            let number = (index + 1).to_string();
            for flag in &part.flags {
                self.run(CommandSpec::new(
                    "parted",
                    ["-s", device.as_str(), "set", number.as_str(), flag.as_str(), "on"],
                ))?;
            }
        }

        Ok(())
    }

    /// Formats every planned partition with its filesystem tool.
    ///
    /// SIGINT is deferred for the duration of each mkfs run; interrupting a
    /// formatter leaves an unusable filesystem behind.
    pub fn format_partitions(
        &self,
        device: &Utf8Path,
        layout: &ResolvedLayout,
    ) -> anyhow::Result<Vec<ResolvedPartition>> {
        let mut resolved = Vec::with_capacity(layout.partitions.len());

        for (index, part) in layout.partitions.iter().enumerate() {
            let path = sysfs::partition_node(device, (index + 1) as u32);
            let spec = CommandSpec::new(
                part.fs_type.mkfs_tool(),
                part.fs_type.mkfs_args(Some(&part.name), path.as_str()),
            );

            info!("format command: {}", spec.display_line());
            {
                let _guard = DeferInterrupts::new()?;
                self.run(spec)?;
            }

            resolved.push(ResolvedPartition {
                uuid: self.read_fs_uuid(&path),
                path,
                label: part.name.clone(),
                fs_type: part.fs_type,
            });
        }

        Ok(resolved)
    }

    /// Re-reads partitions of a device that was provisioned earlier, for a
    /// load-only run.
    pub fn rediscover(
        &self,
        device: &Utf8Path,
        layout: &ResolvedLayout,
    ) -> anyhow::Result<Vec<ResolvedPartition>> {
        let mut resolved = Vec::with_capacity(layout.partitions.len());
        for (index, part) in layout.partitions.iter().enumerate() {
            let path = sysfs::partition_node(device, (index + 1) as u32);
            resolved.push(ResolvedPartition {
                uuid: self.read_fs_uuid(&path),
                path,
                label: part.name.clone(),
                fs_type: part.fs_type,
            });
        }
        Ok(resolved)
    }

    /// Gives the kernel and udev a moment to create the new partition nodes.
    fn settle(&self) {
        let spec = CommandSpec::new("udevadm", ["settle"]);
        match self.executor.execute(&spec) {
            Ok(result) if result.success() => {}
            Ok(_) | Err(_) => {
                debug!("udevadm settle unavailable or failed; continuing");
            }
        }
    }

    fn read_fs_uuid(&self, partition: &Utf8Path) -> Option<String> {
        let spec = CommandSpec::new("blkid", ["-o", "value", "-s", "UUID", partition.as_str()]);
        match self.executor.capture(&spec) {
            Ok(output) if output.success() && !output.value().is_empty() => {
                Some(output.value().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                warn!("could not read filesystem UUID of {}: {}", partition, e);
                None
            }
        }
    }

    fn run(&self, spec: CommandSpec) -> anyhow::Result<()> {
        let result = self.executor.execute(&spec)?;
        if !result.success() {
            let status = result
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FlashwrightError::Execution {
                command: spec.display_line(),
                status,
            }
            .into());
        }
        Ok(())
    }
}

/// 64-bit FNV-1a over a buffer.
fn checksum(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Destructive read/write self-test over the first MiB of the device.
///
/// A random 1 MiB pattern is written with synchronous I/O, read back with
/// synchronous I/O, and compared by checksum. On success the tested region
/// is zeroed; on mismatch the device is left untouched beyond the test
/// region and [`FlashwrightError::DeviceIntegrity`] is raised, so the
/// partition table is never created on unreliable media.
pub fn integrity_check(device: &Utf8Path) -> Result<(), FlashwrightError> {
    info!("checking first MiB of {} for errors", device);

    let mut pattern = vec![0u8; TEST_REGION];
    OsRng.fill_bytes(&mut pattern);
    let expected = checksum(&pattern);

    write_sync(device, &pattern)?;

    let mut readback = vec![0u8; TEST_REGION];
    read_sync(device, &mut readback)?;

    if checksum(&readback) != expected {
        return Err(FlashwrightError::DeviceIntegrity {
            device: device.to_string(),
        });
    }

    // Leave a clean slate for the partition table.
    let zeros = vec![0u8; TEST_REGION];
    write_sync(device, &zeros)?;

    info!("device {} passed the integrity check", device);
    Ok(())
}

fn write_sync(device: &Utf8Path, data: &[u8]) -> Result<(), FlashwrightError> {
    let fd = rustix::fs::open(
        device.as_std_path(),
        OFlags::WRONLY | OFlags::SYNC | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| map_device_errno(device, e))?;

    let mut written = 0;
    while written < data.len() {
        let n = rustix::io::write(&fd, &data[written..]).map_err(|e| map_device_errno(device, e))?;
        if n == 0 {
            return Err(FlashwrightError::io(
                format!("short write to {}", device),
                std::io::Error::from(std::io::ErrorKind::WriteZero),
            ));
        }
        written += n;
    }
    Ok(())
}

fn read_sync(device: &Utf8Path, buf: &mut [u8]) -> Result<(), FlashwrightError> {
    let fd = rustix::fs::open(
        device.as_std_path(),
        OFlags::RDONLY | OFlags::SYNC | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| map_device_errno(device, e))?;

    let mut filled = 0;
    while filled < buf.len() {
        let n = rustix::io::read(&fd, &mut buf[filled..]).map_err(|e| map_device_errno(device, e))?;
        if n == 0 {
            // Device ended early; the comparison will fail on the remainder.
            break;
        }
        filled += n;
    }
    Ok(())
}

fn map_device_errno(device: &Utf8Path, errno: rustix::io::Errno) -> FlashwrightError {
    FlashwrightError::io(device.to_string(), std::io::Error::from(errno))
}

/// Verifies the current user may open the device read-write.
///
/// Raw block nodes are usually group-owned by `disk`; a permission failure
/// here produces an actionable message instead of a mkfs failure later.
pub fn ensure_writable(device: &Utf8Path) -> Result<(), FlashwrightError> {
    match rustix::fs::open(
        device.as_std_path(),
        OFlags::RDWR | OFlags::CLOEXEC,
        Mode::empty(),
    ) {
        Ok(_fd) => Ok(()),
        Err(rustix::io::Errno::ACCESS) => Err(FlashwrightError::io(
            format!(
                "write access to {} is required (are you in the device's group, e.g. disk?)",
                device
            ),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        )),
        Err(e) => Err(map_device_errno(device, e)),
    }
}

/// Unmounts any partition of the chosen device that the host auto-mounted.
///
/// Desktop environments mount inserted cards eagerly; provisioning a mounted
/// device would race the mounted filesystem.
pub fn ensure_unmounted(
    executor: &dyn CommandExecutor,
    partitions: &[Utf8PathBuf],
    proc_mounts: &Utf8Path,
) -> anyhow::Result<()> {
    let mounts = match std::fs::read_to_string(proc_mounts) {
        Ok(content) => content,
        Err(e) => {
            debug!("cannot read {}: {}", proc_mounts, e);
            return Ok(());
        }
    };

    for partition in partitions {
        let mounted = mounts
            .lines()
            .any(|line| line.split_whitespace().next() == Some(partition.as_str()));
        if mounted {
            info!("device {} was mounted, unmounting", partition);
            let spec = CommandSpec::new("umount", [partition.as_str()]);
            let result = executor.execute(&spec)?;
            if !result.success() {
                return Err(FlashwrightError::Unmount {
                    count: 1,
                    detail: format!("{} is busy", partition),
                }
                .into());
            }
        }
    }
    Ok(())
}
