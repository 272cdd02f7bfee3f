//! Sysfs accessors for block devices.
//!
//! Sizes and partition listings are read from `/sys/block` directly; no
//! external tool is needed for them. All functions take the sysfs root as a
//! parameter so tests can point them at a temporary tree.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

/// The real sysfs block-device root.
pub const SYSFS_BLOCK_ROOT: &str = "/sys/block";

/// Returns the size of a whole block device in bytes, or 0 when the device
/// does not exist or exposes no size.
///
/// The sysfs `size` attribute counts 512-byte units regardless of the
/// device's logical sector size. A zero return is meaningful: event sources
/// report pseudo-devices that never materialize, and those read back as 0.
pub fn device_size_bytes(root: &Utf8Path, name: &str) -> u64 {
    let size_path = root.join(name).join("size");
    match fs::read_to_string(&size_path) {
        Ok(content) => content.trim().parse::<u64>().unwrap_or(0) * 512,
        Err(e) => {
            tracing::debug!("cannot determine size of block device {}: {}", name, e);
            0
        }
    }
}

/// Returns the logical sector size of a device in bytes, defaulting to 512.
pub fn logical_sector_size(root: &Utf8Path, name: &str) -> u64 {
    let path = root.join(name).join("queue/logical_block_size");
    fs::read_to_string(&path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
        .unwrap_or(512)
}

/// Lists the partition names of a device, in name order.
///
/// Partitions appear in sysfs as subdirectories of the device whose names
/// extend the device name (`mmcblk0` → `mmcblk0p1`, `sda` → `sda1`).
pub fn partition_names(root: &Utf8Path, name: &str) -> Vec<String> {
    let device_dir = root.join(name);
    let Ok(entries) = fs::read_dir(&device_dir) else {
        return Vec::new();
    };

    let mut partitions: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|child| child != name && child.starts_with(name))
        .collect();
    partitions.sort();
    partitions
}

/// Returns the /dev node path for a device name.
pub fn device_node(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from("/dev").join(name)
}

/// Returns the /dev node path of the `number`-th partition (1-based) of a
/// device.
///
/// Devices whose name ends in a digit get a `p` infix (`mmcblk0p1`,
/// `nvme0n1p1`); all others append the number directly (`sda1`).
pub fn partition_node(device: &Utf8Path, number: u32) -> Utf8PathBuf {
    let name = device.as_str();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        Utf8PathBuf::from(format!("{}p{}", name, number))
    } else {
        Utf8PathBuf::from(format!("{}{}", name, number))
    }
}
