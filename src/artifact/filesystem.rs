//! Filesystem utilities for artifact building.
//!
//! File enumeration, symlink-preserving copies and moves used while
//! extracting `/boot`, expanding ISOs and laying out the ISO and PXE trees.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::process::Cmd;

/// List every non-directory entry under `root`, sorted, without following
/// symlinks.
pub fn enumerate_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to scan {}", root.display()))?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Copy the contents of `src` into `dst` with `cp -a`, preserving ownership,
/// modes, xattrs and hard links. `dst` is created if missing.
pub fn copy_tree_preserving(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    Cmd::new("cp")
        .arg("-a")
        .arg(format!("{}/.", src.display()))
        .arg_path(dst)
        .error_msg(format!(
            "failed to copy ({}) to ({})",
            src.display(),
            dst.display()
        ))
        .run()?;
    Ok(())
}

/// Copy one file, creating parent directories. A symlink is recreated rather
/// than followed.
pub fn copy_file_no_dereference(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if dst.exists() || dst.is_symlink() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Failed to create symlink: {}", dst.display()))?;
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// Move a file by renaming, with fallback to copy+delete across filesystems.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// `path` relative to `root`, rendered as an absolute media path
/// (`/boot/grub2/fonts/unicode.pf2`).
pub fn media_path(root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix(root).with_context(|| {
        format!("{} is not under {}", path.display(), root.display())
    })?;
    Ok(Path::new("/").join(relative))
}
