//! Reading an existing LiveOS ISO.
//!
//! The ISO is mounted read-only only long enough to copy its contents out;
//! everything else works on the copy.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::artifact::classify::{self, Classification, ScanSource, Slot};
use crate::artifact::filesystem::{copy_tree_preserving, enumerate_files};
use crate::build::context::IsoArtifacts;
use crate::cleanup::{merge_cleanup_error, unique_dir};
use crate::mount::LoopMount;

/// Copy the contents of `iso` into `dest`.
///
/// The temporary mount point is created under `build_dir` and removed again
/// on every path.
pub fn extract_iso(iso: &Path, dest: &Path, build_dir: &Path) -> Result<()> {
    info!("extracting {} into {}", iso.display(), dest.display());

    let mount_dir = unique_dir(build_dir, "tmp-iso-mount-")?;
    let result = LoopMount::read_only(iso, &mount_dir, "iso9660")
        .with_context(|| format!("failed to mount iso image ({})", iso.display()))
        .and_then(|mount| {
            let copied = copy_tree_preserving(&mount_dir, dest)
                .with_context(|| format!("failed to copy iso image contents to ({})", dest.display()));
            merge_cleanup_error(copied, mount.close())
        });
    let cleanup = fs::remove_dir(&mount_dir)
        .with_context(|| format!("failed to remove ({})", mount_dir.display()));
    merge_cleanup_error(result, cleanup)
}

/// Build the artifact table of an expanded ISO rooted at `media_root`.
///
/// Generated files of the previous build (the EFI boot image and the PXE
/// grub config) are dropped; unknown files become additional files.
pub fn scan_iso_media(media_root: &Path) -> Result<IsoArtifacts> {
    let mut artifacts = IsoArtifacts::new(media_root);
    let files = enumerate_files(media_root)
        .with_context(|| format!("failed to scan ({})", media_root.display()))?;

    for file in files {
        match classify::classify(media_root, &file, ScanSource::IsoMedia) {
            Classification::Recognized(Slot::EfiBootImage | Slot::PxeGrubCfg) => {
                debug!("dropping regenerated {}", file.display());
            }
            // The writer also places a copy next to the bootloaders; the
            // one under boot/grub2 is scanned first and wins.
            Classification::Recognized(Slot::IsoGrubCfg) if artifacts.iso_grub_cfg.is_some() => {
                debug!("ignoring duplicate grub config {}", file.display());
            }
            Classification::Recognized(slot) => artifacts.record(slot, file),
            Classification::Opaque(media_path) => artifacts.add_additional_file(file, media_path),
        }
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    #[test]
    fn scan_sorts_media_into_slots() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for file in [
            "boot/vmlinuz",
            "boot/initrd.img",
            "boot/efiboot.img",
            "boot/grub2/grub.cfg",
            "boot/grub2/grub-pxe.cfg",
            "boot/grub2/fonts/unicode.pf2",
            "efi/boot/bootx64.efi",
            "efi/boot/grubx64.efi",
            "efi/boot/grub.cfg",
            "liveos/rootfs.img",
            "azl-image-customizer/saved-configs.yaml",
            "motd",
        ] {
            write(&root.join(file));
        }

        let artifacts = scan_iso_media(root).unwrap();

        assert_eq!(artifacts.iso_grub_cfg, Some(root.join("boot/grub2/grub.cfg")));
        assert_eq!(artifacts.pxe_grub_cfg, Some(root.join("boot/grub2/grub-pxe.cfg")));
        assert_eq!(artifacts.vmlinuz, Some(root.join("boot/vmlinuz")));
        assert_eq!(artifacts.initrd_image, Some(root.join("boot/initrd.img")));
        assert_eq!(artifacts.squashfs_image, Some(root.join("liveos/rootfs.img")));
        assert_eq!(
            artifacts.saved_configs_file,
            root.join("azl-image-customizer/saved-configs.yaml")
        );
        assert!(artifacts.require_bootloaders().is_ok());

        let carried: Vec<&PathBuf> = artifacts.additional_files.values().collect();
        assert_eq!(
            carried,
            vec![
                &PathBuf::from("/boot/grub2/fonts/unicode.pf2"),
                &PathBuf::from("/motd")
            ]
        );
    }

    #[test]
    fn extract_failure_removes_mount_point() {
        let temp = TempDir::new().unwrap();
        let result = extract_iso(
            &temp.path().join("missing.iso"),
            &temp.path().join("out"),
            temp.path(),
        );
        assert!(result.is_err());
        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp-iso-mount-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
