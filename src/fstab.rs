//! fstab generation for freshly provisioned root filesystems.

use std::fs;

use anyhow::Result;
use camino::Utf8Path;

use crate::blockdev::ResolvedPartition;
use crate::error::FlashwrightError;
use crate::recipe::PartitionSpec;

/// One line of the generated fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Filesystem identifier: `UUID=...` when known, else the device path.
    pub fs_spec: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

/// Pairs the recipe's mount information with the resolved partitions.
///
/// Partitions are matched by label (the recipe partition name); entries
/// without a mount point are skipped.
pub fn fstab_entries(specs: &[PartitionSpec], resolved: &[ResolvedPartition]) -> Vec<FstabEntry> {
    specs
        .iter()
        .filter(|spec| !spec.mount_point.trim().is_empty())
        .filter_map(|spec| {
            let partition = resolved.iter().find(|p| p.label == spec.name)?;
            let fs_spec = match &partition.uuid {
                Some(uuid) => format!("UUID={}", uuid),
                None => partition.path.to_string(),
            };
            Some(FstabEntry {
                fs_spec,
                mount_point: spec.mount_point.clone(),
                fs_type: spec.fs_type.to_string(),
                options: spec.mount_opts.clone(),
            })
        })
        .collect()
}

/// Renders fstab lines with dump and pass fixed to 0.
pub fn render_fstab(entries: &[FstabEntry]) -> String {
    let mut content = String::from("# generated by flashwright\n");
    for entry in entries {
        content.push_str(&format!(
            "{}\t{}\t{}\t{}\t0\t0\n",
            entry.fs_spec, entry.mount_point, entry.fs_type, entry.options
        ));
    }
    content
}

/// Writes the rendered fstab into `<rootfs_mount>/etc/fstab`.
pub fn write_fstab(rootfs_mount: &Utf8Path, entries: &[FstabEntry]) -> Result<()> {
    let etc = rootfs_mount.join("etc");
    fs::create_dir_all(&etc)
        .map_err(|e| FlashwrightError::io(format!("failed to create {}", etc), e))?;

    let path = etc.join("fstab");
    fs::write(&path, render_fstab(entries))
        .map_err(|e| FlashwrightError::io(format!("failed to write {}", path), e))?;
    tracing::info!("wrote fstab with {} entries to {}", entries.len(), path);
    Ok(())
}
