//! Work directory lifecycle.
//!
//! Directories registered with [`CleanupDirs`] are removed in reverse
//! registration order. Removal failures are collected, never swallowed, and
//! [`merge_cleanup_error`] folds them into the error that triggered teardown.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::LiveOsError;

/// Prepare a work directory, removing it if it exists and creating it fresh.
pub fn prepare_work_dir(parent_dir: &Path, name: &str) -> Result<PathBuf> {
    let work_dir = parent_dir.join(name);
    if work_dir.exists() {
        fs::remove_dir_all(&work_dir)
            .map_err(|e| anyhow!("failed to remove ({}): {}", work_dir.display(), e))?;
    }
    fs::create_dir_all(&work_dir)
        .map_err(|e| anyhow!("failed to create folder ({}): {}", work_dir.display(), e))?;
    Ok(work_dir)
}

/// Create a uniquely named directory under `parent` (e.g. `tmp-iso-mount-3f2a`).
pub fn unique_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    fs::create_dir_all(parent)
        .map_err(|e| anyhow!("failed to create folder ({}): {}", parent.display(), e))?;
    let pid = std::process::id();
    for attempt in 0u32..1000 {
        let candidate = parent.join(format!("{prefix}{pid:x}-{attempt}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(anyhow!(
                    "failed to create temporary folder ({}): {}",
                    candidate.display(),
                    e
                ))
            }
        }
    }
    Err(anyhow!(
        "failed to create a unique '{}' folder under ({})",
        prefix,
        parent.display()
    ))
}

/// Stack of directories owned by one build.
#[derive(Debug, Default)]
pub struct CleanupDirs {
    dirs: Vec<PathBuf>,
}

impl CleanupDirs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Remove every registered directory, most recent first.
    ///
    /// All directories are attempted even if an earlier removal fails.
    pub fn clean_up(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(dir) = self.dirs.pop() {
            debug!("removing {}", dir.display());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("failed to remove ({}): {}", dir.display(), e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LiveOsError::CleanupFailed(failures.join("\n")).into())
        }
    }
}

/// Combine an operation result with its teardown result.
///
/// When both failed the returned error carries both messages.
pub fn merge_cleanup_error<T>(result: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup_err)) => Err(cleanup_err.context("failed to clean-up")),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => Err(anyhow!(
            "{:#}:\nfailed to clean-up:\n{:#}",
            err,
            cleanup_err
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prepare_work_dir_recreates_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale"), "x").unwrap();

        let prepared = prepare_work_dir(temp.path(), "work").unwrap();
        assert_eq!(prepared, dir);
        assert!(!dir.join("stale").exists());
    }

    #[test]
    fn unique_dir_never_reuses_a_name() {
        let temp = TempDir::new().unwrap();
        let a = unique_dir(temp.path(), "tmp-iso-mount-").unwrap();
        let b = unique_dir(temp.path(), "tmp-iso-mount-").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
    }

    #[test]
    fn clean_up_removes_all_registered_dirs() {
        let temp = TempDir::new().unwrap();
        let outer = temp.path().join("outer");
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();

        let mut dirs = CleanupDirs::new();
        dirs.register(&outer);
        dirs.register(&inner);
        dirs.clean_up().unwrap();

        assert!(!outer.exists());
        assert!(dirs.is_empty());
    }

    #[test]
    fn clean_up_tolerates_missing_dirs() {
        let temp = TempDir::new().unwrap();
        let mut dirs = CleanupDirs::new();
        dirs.register(temp.path().join("never-created"));
        assert!(dirs.clean_up().is_ok());
    }

    #[test]
    fn merge_keeps_both_messages() {
        let result: Result<()> = Err(anyhow!("squashfs step failed"));
        let cleanup: Result<()> = Err(anyhow!("failed to remove (/tmp/x)"));
        let msg = merge_cleanup_error(result, cleanup).unwrap_err().to_string();
        assert!(msg.contains("squashfs step failed"));
        assert!(msg.contains("failed to remove (/tmp/x)"));
    }

    #[test]
    fn merge_reports_cleanup_failure_after_success() {
        let result: Result<u32> = Ok(7);
        let cleanup: Result<()> = Err(anyhow!("busy"));
        assert!(merge_cleanup_error(result, cleanup).is_err());
        assert_eq!(merge_cleanup_error(Ok(7), Ok(())).unwrap(), 7);
    }
}
