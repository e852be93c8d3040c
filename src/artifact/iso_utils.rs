//! ISO creation utilities.
//!
//! Media tree layout, the FAT image El Torito boots from, and the `xorriso`
//! invocation.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::layout::{GRUB_CFG_DIR, ISO_BOOTLOADERS_DIR, ISO_BOOT_DIR, LIVEOS_DIR};
use crate::process::Cmd;

/// Formats the EFI boot image.
pub const EFIBOOT_MKFS: &str = "mkfs.fat";

/// Smallest FAT image `mkfs.fat -F 16` accepts comfortably.
const MIN_EFIBOOT_SIZE_MB: u64 = 16;

/// Hybrid GPT needs the ISO filesystem to start past the partition table.
const XORRISO_PARTITION_OFFSET: u32 = 16;

const XORRISO_FS_FLAGS: &[&str] = &[
    "-iso-level",
    "3",
    "-full-iso9660-filenames",
    "-joliet",
    "-joliet-long",
    "-rational-rock",
];

/// Create the LiveOS media tree, removing any previous one.
///
/// ```text
/// iso_root/
///   boot/grub2/   kernel, initrd, grub.cfg
///   efi/boot/     shim and grub
///   liveos/       rootfs.img
/// ```
pub fn setup_iso_structure(iso_root: &Path) -> Result<()> {
    if iso_root.exists() {
        fs::remove_dir_all(iso_root)
            .with_context(|| format!("failed to remove ({})", iso_root.display()))?;
    }

    for dir in [GRUB_CFG_DIR, ISO_BOOT_DIR, ISO_BOOTLOADERS_DIR, LIVEOS_DIR] {
        fs::create_dir_all(iso_root.join(dir))
            .with_context(|| format!("failed to create ({})", iso_root.join(dir).display()))?;
    }

    Ok(())
}

/// Create an empty FAT16 image of `size_mb` megabytes.
pub fn create_fat16_image(output: &Path, size_mb: u64) -> Result<()> {
    {
        let file = fs::File::create(output)
            .with_context(|| format!("failed to create ({})", output.display()))?;
        file.set_len(size_mb * 1024 * 1024)?;
    }

    Cmd::new(EFIBOOT_MKFS)
        .args(["-F", "16"])
        .arg_path(output)
        .error_msg("mkfs.fat failed. Install dosfstools.")
        .run()?;

    Ok(())
}

/// Create `::EFI/BOOT` inside a FAT image.
pub fn create_efi_dirs_in_fat(fat_image: &Path) -> Result<()> {
    let img_str = fat_image.to_string_lossy();

    Cmd::new("mmd")
        .args(["-i", &img_str, "::EFI"])
        .error_msg("mmd failed. Install mtools.")
        .run()?;

    Cmd::new("mmd")
        .args(["-i", &img_str, "::EFI/BOOT"])
        .error_msg("mmd failed to create ::EFI/BOOT directory")
        .run()?;

    Ok(())
}

/// Copy a file into a FAT image using mcopy.
pub fn mcopy_to_fat(fat_image: &Path, src: &Path, dst: &str) -> Result<()> {
    let img_str = fat_image.to_string_lossy();

    Cmd::new("mcopy")
        .args(["-i", &img_str])
        .arg_path(src)
        .arg(dst)
        .error_msg(format!("mcopy failed to copy {}", src.display()))
        .run()?;

    Ok(())
}

/// FAT image size that fits `bytes` of content plus filesystem overhead.
pub fn efiboot_size_mb(bytes: u64) -> u64 {
    (bytes.div_ceil(1024 * 1024) + 2).max(MIN_EFIBOOT_SIZE_MB)
}

/// Build the EFI boot image: a FAT16 image holding `efi_files` under
/// `::EFI/BOOT/`, each under the given file name.
pub fn create_efi_boot_image(output: &Path, efi_files: &[(&Path, &str)]) -> Result<()> {
    let mut total = 0;
    for (src, _) in efi_files {
        total += fs::metadata(src)
            .with_context(|| format!("failed to stat ({})", src.display()))?
            .len();
    }

    create_fat16_image(output, efiboot_size_mb(total))?;
    create_efi_dirs_in_fat(output)?;
    for (src, name) in efi_files {
        mcopy_to_fat(output, src, &format!("::EFI/BOOT/{}", name))?;
    }

    Ok(())
}

/// Run xorriso to create a UEFI-bootable hybrid ISO.
///
/// `efiboot` is the FAT image path relative to `iso_root`.
pub fn run_xorriso(iso_root: &Path, output: &Path, label: &str, efiboot: &str) -> Result<()> {
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-V", label])
        .args(["-partition_offset", &XORRISO_PARTITION_OFFSET.to_string()])
        .args(XORRISO_FS_FLAGS)
        .args(["-e", efiboot, "-no-emul-boot", "-isohybrid-gpt-basdat"])
        .arg_path(iso_root)
        .error_msg("xorriso failed. Install xorriso.")
        .run_interactive()?;

    Ok(())
}
