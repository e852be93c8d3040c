//! mtools operations for populating a FAT image without mounting it.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::process::Cmd;

/// Copy the contents of `src_dir` into the root of a FAT image, recursing
/// into subdirectories.
///
/// Returns the number of top-level entries copied.
pub fn mtools_copy_tree(image: &Path, src_dir: &Path) -> Result<usize> {
    let mut entries = fs::read_dir(src_dir)
        .with_context(|| format!("failed to read ({})", src_dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    if entries.is_empty() {
        return Ok(0);
    }

    Cmd::new("mcopy")
        .args(["-s", "-p", "-i"])
        .arg_path(image)
        .args(entries.iter().map(|p| p.to_string_lossy().into_owned()))
        .arg("::")
        .error_msg(format!("mcopy failed to copy ({})", src_dir.display()))
        .run()?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_of_empty_dir_is_noop() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("never-created.img");
        assert_eq!(mtools_copy_tree(&image, temp.path()).unwrap(), 0);
    }

    #[test]
    fn test_copy_tree_of_missing_dir_fails() {
        let temp = TempDir::new().unwrap();
        assert!(mtools_copy_tree(&temp.path().join("efi.img"), &temp.path().join("none")).is_err());
    }
}
