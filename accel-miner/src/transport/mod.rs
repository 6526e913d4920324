//! Physical transport for accelerators.
//!
//! On Linux an accelerator is exposed by its kernel driver as a character
//! device node. Discovery checks that the node exists and really is a
//! character device before anything tries to open it.

#[cfg(target_os = "linux")]
pub mod chardev;

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Node created by the accelerator kernel driver.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/sha256";

/// A device node that passed discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharDeviceInfo {
    pub path: PathBuf,
}

/// Check that `path` names a character device.
pub fn probe_char_device(path: &Path) -> Result<CharDeviceInfo> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        Error::Device(format!("{}: {}", path.display(), e))
    })?;

    if !metadata.file_type().is_char_device() {
        return Err(Error::Device(format!(
            "{}: not a character device",
            path.display()
        )));
    }

    debug!(path = %path.display(), "Found accelerator device node");
    Ok(CharDeviceInfo {
        path: path.to_path_buf(),
    })
}
