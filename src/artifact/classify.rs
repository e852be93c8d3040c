//! Tag well-known files in an extracted `/boot` or ISO tree.
//!
//! Every file is either [`Classification::Recognized`] (it feeds a dedicated
//! artifact slot) or [`Classification::Opaque`] (it is carried to the media
//! unchanged at its path relative to the scanned root).

use std::path::{Path, PathBuf};

use crate::layout::{
    BOOTX64_BINARY, GRUBX64_BINARY, GRUBX64_NOPREFIX_BINARY, INITRD_IMAGE, ISO_GRUB_CFG,
    LIVEOS_IMAGE, PXE_GRUB_CFG, SAVED_CONFIGS_FILE, VMLINUZ, VMLINUZ_PREFIX,
};

/// Which tree is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    /// `/boot` of a full image's root filesystem.
    BootDir,
    /// Root of an expanded LiveOS ISO.
    IsoMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Shim,
    Grub,
    GrubNoPrefix,
    IsoGrubCfg,
    /// A grub config derived for PXE by an earlier build; always regenerated.
    PxeGrubCfg,
    Kernel,
    Initrd,
    Squashfs,
    SavedConfig,
    /// The FAT image the ISO writer builds for El Torito; always regenerated.
    EfiBootImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Recognized(Slot),
    /// Media path (always absolute, e.g. `/grub2/fonts/unicode.pf2`).
    Opaque(PathBuf),
}

/// Name of the FAT boot image inside the media.
pub const EFI_BOOT_IMAGE: &str = "efiboot.img";

/// Classify `path`, which lives under `root`.
pub fn classify(root: &Path, path: &Path, source: ScanSource) -> Classification {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let slot = match (source, file_name) {
        (_, BOOTX64_BINARY) => Some(Slot::Shim),
        (_, GRUBX64_BINARY) => Some(Slot::Grub),
        (ScanSource::BootDir, GRUBX64_NOPREFIX_BINARY) => Some(Slot::GrubNoPrefix),
        (_, ISO_GRUB_CFG) => Some(Slot::IsoGrubCfg),
        (ScanSource::IsoMedia, PXE_GRUB_CFG) => Some(Slot::PxeGrubCfg),
        (ScanSource::IsoMedia, LIVEOS_IMAGE) => Some(Slot::Squashfs),
        (ScanSource::IsoMedia, INITRD_IMAGE) => Some(Slot::Initrd),
        (ScanSource::IsoMedia, SAVED_CONFIGS_FILE) => Some(Slot::SavedConfig),
        (ScanSource::IsoMedia, EFI_BOOT_IMAGE) => Some(Slot::EfiBootImage),
        (ScanSource::IsoMedia, VMLINUZ) => Some(Slot::Kernel),
        (_, name) if name.starts_with(VMLINUZ_PREFIX) => Some(Slot::Kernel),
        _ => None,
    };

    match slot {
        Some(slot) => Classification::Recognized(slot),
        None => {
            let relative = path.strip_prefix(root).unwrap_or(path);
            Classification::Opaque(Path::new("/").join(relative))
        }
    }
}

/// Files under a full image's `/boot` that are regenerated for the LiveOS
/// and must never reach the media: existing initrd images and the ESP's
/// redirect-only grub config.
///
/// `rootfs_path` is the file's path relative to the root filesystem, with a
/// leading `/` (e.g. `/boot/initramfs-6.6.img`).
pub fn is_regenerable_boot_file(rootfs_path: &str) -> bool {
    if rootfs_path.contains("/boot/initrd.img") {
        return true;
    }
    if let Some(index) = rootfs_path.find("/boot/initramfs-") {
        if rootfs_path[index + "/boot/initramfs-".len()..].contains(".img") {
            return true;
        }
    }
    rootfs_path.contains("/boot/efi/boot/grub2/grub.cfg")
}

/// Whether a prefix-less grub is among `files`.
pub fn contains_grub_noprefix(files: &[PathBuf]) -> bool {
    files.iter().any(|f| {
        f.file_name()
            .is_some_and(|name| name == GRUBX64_NOPREFIX_BINARY)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot(name: &str) -> Classification {
        classify(Path::new("/r/boot"), &Path::new("/r/boot").join(name), ScanSource::BootDir)
    }

    fn iso(name: &str) -> Classification {
        classify(Path::new("/x"), &Path::new("/x").join(name), ScanSource::IsoMedia)
    }

    #[test]
    fn boot_dir_recognizes_bootloaders_and_kernel() {
        assert_eq!(boot("efi/EFI/BOOT/bootx64.efi"), Classification::Recognized(Slot::Shim));
        assert_eq!(boot("efi/EFI/BOOT/grubx64.efi"), Classification::Recognized(Slot::Grub));
        assert_eq!(
            boot("efi/EFI/BOOT/grubx64-noprefix.efi"),
            Classification::Recognized(Slot::GrubNoPrefix)
        );
        assert_eq!(boot("grub2/grub.cfg"), Classification::Recognized(Slot::IsoGrubCfg));
        assert_eq!(boot("vmlinuz-6.6.51.1-5.azl3"), Classification::Recognized(Slot::Kernel));
    }

    #[test]
    fn boot_dir_keeps_media_names_opaque() {
        assert_eq!(boot("rootfs.img"), Classification::Opaque(PathBuf::from("/rootfs.img")));
        assert_eq!(
            boot("grub2/fonts/unicode.pf2"),
            Classification::Opaque(PathBuf::from("/grub2/fonts/unicode.pf2"))
        );
    }

    #[test]
    fn iso_media_recognizes_generated_artifacts() {
        assert_eq!(iso("liveos/rootfs.img"), Classification::Recognized(Slot::Squashfs));
        assert_eq!(iso("boot/initrd.img"), Classification::Recognized(Slot::Initrd));
        assert_eq!(iso("boot/vmlinuz"), Classification::Recognized(Slot::Kernel));
        assert_eq!(
            iso("azl-image-customizer/saved-configs.yaml"),
            Classification::Recognized(Slot::SavedConfig)
        );
        assert_eq!(iso("boot/grub2/grub-pxe.cfg"), Classification::Recognized(Slot::PxeGrubCfg));
        assert_eq!(iso("boot/efiboot.img"), Classification::Recognized(Slot::EfiBootImage));
        assert_eq!(iso("motd"), Classification::Opaque(PathBuf::from("/motd")));
    }

    #[test]
    fn regenerable_boot_files_are_excluded() {
        assert!(is_regenerable_boot_file("/boot/initrd.img-6.6.51"));
        assert!(is_regenerable_boot_file("/boot/initramfs-6.6.51.img"));
        assert!(is_regenerable_boot_file("/boot/efi/boot/grub2/grub.cfg"));
        assert!(!is_regenerable_boot_file("/boot/grub2/grub.cfg"));
        assert!(!is_regenerable_boot_file("/boot/vmlinuz-6.6.51"));
        assert!(!is_regenerable_boot_file("/boot/initramfs-readme"));
    }

    #[test]
    fn detects_noprefix_grub() {
        let files = vec![
            PathBuf::from("/r/boot/efi/EFI/BOOT/bootx64.efi"),
            PathBuf::from("/r/boot/efi/EFI/BOOT/grubx64-noprefix.efi"),
        ];
        assert!(contains_grub_noprefix(&files));
        assert!(!contains_grub_noprefix(&files[..1]));
    }
}
