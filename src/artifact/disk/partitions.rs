//! ESP and root partition images for writeable disks.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::helpers::DiskUuids;
use super::mtools;
use crate::process::Cmd;

/// Formats the ESP image.
pub const ESP_MKFS: &str = "mkfs.vfat";

/// Create a FAT32 ESP image holding the contents of `efi_tree`.
pub fn create_efi_partition(
    image_path: &Path,
    size_mb: u64,
    uuids: &DiskUuids,
    efi_tree: &Path,
) -> Result<()> {
    create_sparse_file(image_path, size_mb)?;

    // Volume ID is the serial without the dash.
    let vol_id = uuids.efi_fs_uuid.replace('-', "");
    Cmd::new(ESP_MKFS)
        .args(["-F", "32", "-n", "esp", "-i", &vol_id])
        .arg_path(image_path)
        .error_msg("mkfs.vfat failed")
        .run()?;

    if efi_tree.is_dir() {
        mtools::mtools_copy_tree(image_path, efi_tree)?;
    }
    Ok(())
}

/// Create an ext4 root partition image populated from `rootfs` (mkfs.ext4 -d).
pub fn create_root_partition(
    rootfs: &Path,
    image_path: &Path,
    size_mb: u64,
    uuids: &DiskUuids,
) -> Result<()> {
    create_sparse_file(image_path, size_mb)?;

    Cmd::new("mkfs.ext4")
        .args(["-q", "-L", "rootfs"])
        .args(["-U", &uuids.root_fs_uuid])
        .args(["-d"])
        .arg_path(rootfs)
        .arg_path(image_path)
        .error_msg("mkfs.ext4 -d failed. Check that e2fsprogs supports -d flag.")
        .run()?;
    Ok(())
}

fn create_sparse_file(path: &Path, size_mb: u64) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("failed to create ({})", path.display()))?;
    file.set_len(size_mb * 1024 * 1024)
        .with_context(|| format!("failed to size ({})", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sparse_file_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("part.img");
        create_sparse_file(&path, 3).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 3 * 1024 * 1024);
    }

    #[test]
    #[ignore = "requires e2fsprogs"]
    fn test_root_partition_from_directory() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "live").unwrap();
        let uuids = DiskUuids {
            root_fs_uuid: "5b6f4d1e-8a3c-4f3e-9b52-0c1d2e3f4a5b".into(),
            efi_fs_uuid: "ABCD-1234".into(),
            root_part_uuid: "0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0f9".into(),
        };
        let image = temp.path().join("root.img");
        create_root_partition(&rootfs, &image, 16, &uuids).unwrap();
        assert_eq!(fs::metadata(&image).unwrap().len(), 16 * 1024 * 1024);
    }
}
