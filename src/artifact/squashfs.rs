//! Squashfs image builder.
//!
//! Wraps `mksquashfs` to pack the writeable LiveOS root into one compressed
//! read-only image.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::process::Cmd;

/// Build a squashfs image from a directory.
///
/// Any image already at `output` is deleted first so `mksquashfs` never
/// appends to it.
pub fn build_squashfs(source_dir: &Path, output: &Path) -> Result<()> {
    info!("creating squashfs of {}", source_dir.display());

    if output.exists() {
        fs::remove_file(output).with_context(|| {
            format!("failed to delete existing squashfs image ({})", output.display())
        })?;
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }

    Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .error_msg("failed to create squashfs")
        .run_interactive()?;
    Ok(())
}
