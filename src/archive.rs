//! Tar archive handling for artifact delivery.
//!
//! Rootfs and boot products usually arrive as plain tar archives and are
//! extracted onto the mounted partition; command targets accept single-file
//! archives that are unpacked before substitution.

use std::fs::File;
use std::io::Read;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tar::Archive;
use tracing::info;

use crate::error::FlashwrightError;

/// Returns true if the file looks like a tar archive.
///
/// Detection is by the `ustar` magic at offset 257, matching how the
/// original artifacts are produced; extensions are not trusted.
pub fn is_tar_file(path: &Utf8Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut header = [0u8; 262];
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    &header[257..262] == b"ustar"
}

/// Extracts a tar archive into a directory, reporting progress.
///
/// Entries that would escape the destination are refused by the unpacker
/// and reported as errors rather than silently skipped.
pub fn extract_all(archive_path: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    info!("extracting tar file {} into {}", archive_path, dest);

    let file = File::open(archive_path).map_err(|e| {
        FlashwrightError::io(format!("failed to open archive: {}", archive_path), e)
    })?;
    let mut archive = Archive::new(file);

    let mut count: u64 = 0;
    for entry in archive.entries().map_err(|e| {
        FlashwrightError::io(format!("failed to read archive: {}", archive_path), e)
    })? {
        let mut entry = entry.map_err(|e| {
            FlashwrightError::io(format!("corrupt entry in archive: {}", archive_path), e)
        })?;
        entry.unpack_in(dest.as_std_path()).map_err(|e| {
            FlashwrightError::io(format!("failed to unpack archive entry into {}", dest), e)
        })?;

        count += 1;
        if count % 200 == 0 {
            info!("extracted {} entries...", count);
        }
    }

    info!("extracted {} entries from {}", count, archive_path);
    Ok(())
}

/// Extracts a single-member archive and returns the extracted file path.
///
/// Command targets substitute `${file}` with one concrete file; an archive
/// with any other member count cannot be delivered that way and is a fatal
/// error.
pub fn extract_single_member(archive_path: &Utf8Path, dest: &Utf8Path) -> Result<Utf8PathBuf> {
    let file = File::open(archive_path).map_err(|e| {
        FlashwrightError::io(format!("failed to open archive: {}", archive_path), e)
    })?;
    let mut archive = Archive::new(file);

    let mut member_name = None;
    let mut members = 0usize;
    for entry in archive.entries().map_err(|e| {
        FlashwrightError::io(format!("failed to read archive: {}", archive_path), e)
    })? {
        let entry = entry.map_err(|e| {
            FlashwrightError::io(format!("corrupt entry in archive: {}", archive_path), e)
        })?;
        members += 1;
        if member_name.is_none() {
            let path = entry.path().map_err(|e| {
                FlashwrightError::io(format!("bad entry path in archive: {}", archive_path), e)
            })?;
            member_name = Utf8PathBuf::from_path_buf(path.into_owned()).ok();
        }
    }

    if members != 1 {
        return Err(FlashwrightError::Recipe(format!(
            "archive {} has {} members; a command target needs exactly one to know which file to \
            pass",
            archive_path, members
        ))
        .into());
    }
    let member_name = member_name.ok_or_else(|| {
        FlashwrightError::Recipe(format!("archive {} member has a non-UTF-8 path", archive_path))
    })?;

    extract_all(archive_path, dest)?;
    Ok(dest.join(member_name))
}
