//! Device-path resolution
//!
//! Providers report a LUN or device name; the kernel exposes the actual
//! block device behind a predictable symlink (`/dev/disk/by-id/...`,
//! `/dev/disk/azure/scsi1/lun<N>`, ...). The predicted path must be a
//! symlink resolving to a real device; kernel uevents can lag the
//! provider's "attached" status, so resolution retries a bounded number of
//! times.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

fn invalid(path: &Path) -> Error {
    Error::InvalidDevicePath {
        path: path.display().to_string(),
    }
}

/// Resolve a predicted device symlink to its target.
///
/// The predicted path must itself be a symlink (a regular file at the
/// predicted location means the node was never created by udev), and the
/// target must exist. With `require_block_device` the target must be an
/// actual block device node.
pub fn resolve_device_path(predicted: &Path, require_block_device: bool) -> Result<PathBuf> {
    let meta = std::fs::symlink_metadata(predicted).map_err(|_| invalid(predicted))?;
    if !meta.file_type().is_symlink() {
        return Err(invalid(predicted));
    }

    let target = std::fs::read_link(predicted).map_err(|_| invalid(predicted))?;
    let resolved = if target.is_absolute() {
        target
    } else {
        predicted
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(target)
    };

    let target_meta = std::fs::metadata(&resolved).map_err(|_| invalid(predicted))?;
    if require_block_device {
        use std::os::unix::fs::FileTypeExt;
        if !target_meta.file_type().is_block_device() {
            return Err(invalid(predicted));
        }
    }

    Ok(resolved)
}

/// Resolve with bounded retries spaced by `interval`.
pub async fn wait_for_device_path(
    predicted: &Path,
    retries: u32,
    interval: Duration,
    require_block_device: bool,
) -> Result<PathBuf> {
    let mut last = invalid(predicted);
    for attempt in 0..=retries {
        match resolve_device_path(predicted, require_block_device) {
            Ok(path) => return Ok(path),
            Err(e) => {
                debug!(
                    predicted = %predicted.display(),
                    attempt,
                    "device path not resolvable yet"
                );
                last = e;
            }
        }
        if attempt < retries {
            tokio::time::sleep(interval).await;
        }
    }
    Err(last)
}
