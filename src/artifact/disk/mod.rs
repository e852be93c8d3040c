//! Writeable disk images rebuilt from a LiveOS squashfs.
//!
//! The squashfs is mounted read-only and copied to a staging tree, which gets
//! a fresh fstab. The ESP and root partitions are built as separate images
//! (mtools and `mkfs.ext4 -d`, no partition mounts) and spliced into a GPT
//! disk.
//!
//! ```text
//! disk.raw
//!   p1  1 MiB - 9 MiB   vfat  /boot/efi
//!   p2  9 MiB - end     ext4  /
//! ```

pub mod assembly;
pub mod helpers;
pub mod mtools;
pub mod partitions;

pub use helpers::DiskUuids;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::filesystem::{atomic_move, copy_tree_preserving};
use crate::cleanup::{merge_cleanup_error, prepare_work_dir, unique_dir};
use crate::layout::{ESP_END_MIB, ESP_MOUNT_POINT, ESP_START_MIB};
use crate::mount::fstab::{mount_target, render_fstab};
use crate::mount::LoopMount;

/// Scratch directory for disk assembly, relative to the build dir.
pub const WRITEABLE_IMAGE_WORK_DIR: &str = "writeable-raw-image";

/// Build a raw GPT disk image at `output` from the contents of `squashfs`.
pub fn create_writeable_image_from_squashfs(
    squashfs: &Path,
    build_dir: &Path,
    output: &Path,
) -> Result<PathBuf> {
    info!("creating writeable disk image from {}", squashfs.display());

    let work_dir = prepare_work_dir(build_dir, WRITEABLE_IMAGE_WORK_DIR)?;
    let result = assemble_from_squashfs(squashfs, build_dir, &work_dir, output);
    let cleanup = fs::remove_dir_all(&work_dir)
        .with_context(|| format!("failed to remove ({})", work_dir.display()));
    merge_cleanup_error(result, cleanup)
}

fn assemble_from_squashfs(
    squashfs: &Path,
    build_dir: &Path,
    work_dir: &Path,
    output: &Path,
) -> Result<PathBuf> {
    let rootfs = work_dir.join("rootfs");
    let root_mb = extract_squashfs(squashfs, build_dir, &rootfs)?;

    let uuids = DiskUuids::generate()?;
    debug!(
        "root fs uuid {}, esp serial {}, root partuuid {}",
        uuids.root_fs_uuid, uuids.efi_fs_uuid, uuids.root_part_uuid
    );
    write_fstab(&rootfs, &uuids)?;

    let efi_dir = mount_target(&rootfs, ESP_MOUNT_POINT);
    let efi_image = work_dir.join("efi.img");
    partitions::create_efi_partition(&efi_image, ESP_END_MIB - ESP_START_MIB, &uuids, &efi_dir)?;
    // The ESP content now lives in its own partition; leave the mount point.
    empty_dir(&efi_dir)?;

    let root_image = work_dir.join("root.img");
    partitions::create_root_partition(&rootfs, &root_image, root_mb, &uuids)?;

    let raw = work_dir.join("disk.raw");
    assembly::assemble_disk(&raw, &efi_image, &root_image, root_mb, &uuids)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }
    if output.exists() {
        fs::remove_file(output)
            .with_context(|| format!("failed to remove ({})", output.display()))?;
    }
    atomic_move(&raw, output).context("failed to move disk image to output")?;
    info!("writeable disk image: {}", output.display());
    Ok(output.to_path_buf())
}

/// Copy the squashfs content to `rootfs` and return the root partition size
/// (MB) it needs.
fn extract_squashfs(squashfs: &Path, build_dir: &Path, rootfs: &Path) -> Result<u64> {
    let mount_dir = unique_dir(build_dir, "tmp-squashfs-mount-")?;
    let result = LoopMount::read_only(squashfs, &mount_dir, "squashfs").and_then(|mount| {
        let copied = copy_mounted_squashfs(&mount_dir, rootfs);
        merge_cleanup_error(copied, mount.close())
    });
    let cleanup = fs::remove_dir(&mount_dir)
        .with_context(|| format!("failed to remove ({})", mount_dir.display()));
    merge_cleanup_error(result, cleanup)
}

fn copy_mounted_squashfs(mount_dir: &Path, rootfs: &Path) -> Result<u64> {
    let content_bytes = helpers::size_on_disk_bytes(mount_dir)?;
    let root_mb = helpers::disk_size_estimate_mb(content_bytes);
    info!(
        "squashfs content is {} bytes, root partition will be {} MB",
        content_bytes, root_mb
    );
    copy_tree_preserving(mount_dir, rootfs)?;
    Ok(root_mb)
}

fn write_fstab(rootfs: &Path, uuids: &DiskUuids) -> Result<()> {
    let fstab = rootfs.join("etc/fstab");
    if let Some(parent) = fstab.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }
    fs::write(
        &fstab,
        render_fstab(&uuids.root_fs_uuid, &uuids.efi_fs_uuid, ESP_MOUNT_POINT),
    )
    .with_context(|| format!("failed to write ({})", fstab.display()))
}

fn empty_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).with_context(|| format!("failed to create ({})", dir.display()))?;
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read ({})", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("failed to remove ({})", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uuids() -> DiskUuids {
        DiskUuids {
            root_fs_uuid: "5b6f4d1e-8a3c-4f3e-9b52-0c1d2e3f4a5b".into(),
            efi_fs_uuid: "ABCD-1234".into(),
            root_part_uuid: "0f1e2d3c-4b5a-4978-8695-a4b3c2d1e0f9".into(),
        }
    }

    #[test]
    fn test_fstab_names_both_filesystems() {
        let temp = TempDir::new().unwrap();
        write_fstab(temp.path(), &uuids()).unwrap();
        let fstab = fs::read_to_string(temp.path().join("etc/fstab")).unwrap();
        assert!(fstab.contains("UUID=5b6f4d1e-8a3c-4f3e-9b52-0c1d2e3f4a5b / ext4"));
        assert!(fstab.contains("UUID=ABCD-1234 /boot/efi vfat umask=0077"));
    }

    #[test]
    fn test_empty_dir_keeps_mount_point() {
        let temp = TempDir::new().unwrap();
        let efi = temp.path().join("boot/efi");
        fs::create_dir_all(efi.join("EFI/BOOT")).unwrap();
        fs::write(efi.join("EFI/BOOT/bootx64.efi"), "shim").unwrap();
        fs::write(efi.join("startup.nsh"), "").unwrap();

        empty_dir(&efi).unwrap();

        assert!(efi.is_dir());
        assert_eq!(fs::read_dir(&efi).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_squashfs_leaves_no_work_dir() {
        let temp = TempDir::new().unwrap();
        let result = create_writeable_image_from_squashfs(
            &temp.path().join("missing.img"),
            temp.path(),
            &temp.path().join("out/disk.raw"),
        );
        assert!(result.is_err());
        assert!(!temp.path().join(WRITEABLE_IMAGE_WORK_DIR).exists());
        assert!(!temp.path().join("out/disk.raw").exists());
    }

    #[test]
    #[ignore = "requires root, squashfs-tools, dosfstools, mtools and e2fsprogs"]
    fn test_disk_from_squashfs() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("boot/efi/EFI/BOOT")).unwrap();
        fs::write(src.join("boot/efi/EFI/BOOT/bootx64.efi"), "shim").unwrap();
        fs::create_dir_all(src.join("etc")).unwrap();
        let squashfs = temp.path().join("rootfs.img");
        crate::artifact::squashfs::build_squashfs(&src, &squashfs).unwrap();

        let output = temp.path().join("disk.raw");
        create_writeable_image_from_squashfs(&squashfs, temp.path(), &output).unwrap();
        assert!(fs::metadata(&output).unwrap().len() > ESP_END_MIB * 1024 * 1024);
    }
}
