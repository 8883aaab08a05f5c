//! Container image pulling.
//!
//! Delegates the actual pull to an external tool that pushes directly into
//! the object store: it deposits a committed tree containing `manifest.json`
//! and `content` (the image configuration) under `ociimage/<escaped-ref>`,
//! and one commit per layer and config blob under `ociimage/<digest>`.

use std::path::Path;
use std::process::Command;

use crate::error::{FlatpodError, Result};
use crate::image::ImageReference;
use crate::utils::logger::Logger;

/// External tool invoked as `flatpod-pull <image-ref> <store-path>`.
pub const PULL_COMMAND: &str = "flatpod-pull";

/// Materialize the image into the object store. A non-zero exit from the
/// pull tool aborts the pipeline with that exit code.
pub fn pull(image: &ImageReference, store_path: &Path) -> Result<()> {
    Logger::info(&format!("Pulling {}", image));

    let status = Command::new(PULL_COMMAND)
        .arg(image.full_name())
        .arg(store_path)
        .status()
        .map_err(|e| {
            FlatpodError::Repo(format!("cannot run {}: {}", PULL_COMMAND, e))
        })?;

    if !status.success() {
        return Err(FlatpodError::PullFailed {
            code: status.code().unwrap_or(1),
        });
    }

    Ok(())
}
