//! Final ISO assembly and the PXE artifacts tree.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::iso_input::extract_iso;
use crate::artifact::filesystem::atomic_move;
use crate::artifact::iso::{FileToCopy, IsoWriteRequest, IsoWriter};
use crate::build::context::IsoArtifacts;
use crate::config::{CustomizationOptions, WorkingDirs};
use crate::layout::{
    BOOTX64_BINARY, GRUBX64_BINARY, GRUB_CFG_DIR, ISO_BOOTLOADERS_DIR, ISO_GRUB_CFG,
    ISO_VOLUME_LABEL, LIVEOS_DIR, LIVEOS_IMAGE, PXE_GRUB_CFG, SAVED_CONFIGS_DIR,
    SAVED_CONFIGS_FILE,
};

/// Everything that goes on the media besides the initrd and grub.cfg.
pub fn media_files(artifacts: &IsoArtifacts, options: &CustomizationOptions) -> Result<Vec<FileToCopy>> {
    let Some(squashfs) = artifacts.squashfs_image.as_ref() else {
        bail!("no LiveOS squashfs image was produced");
    };

    let mut files = vec![FileToCopy::from_source(
        squashfs,
        Path::new("/").join(LIVEOS_DIR).join(LIVEOS_IMAGE),
    )];

    for (source, media_path) in &artifacts.additional_files {
        files.push(FileToCopy {
            no_dereference: true,
            ..FileToCopy::from_source(source, media_path)
        });
    }

    if artifacts.saved_configs_file.exists() {
        files.push(FileToCopy::from_source(
            &artifacts.saved_configs_file,
            Path::new("/").join(SAVED_CONFIGS_DIR).join(SAVED_CONFIGS_FILE),
        ));
    }

    if let Some(pxe_cfg) = artifacts.pxe_grub_cfg.as_ref().filter(|p| p.exists()) {
        files.push(FileToCopy::from_source(
            pxe_cfg,
            Path::new("/").join(GRUB_CFG_DIR).join(PXE_GRUB_CFG),
        ));
    }

    files.extend(options.additional_files.iter().cloned());
    Ok(files)
}

/// Write the ISO and, when requested and possible, the PXE artifacts tree.
///
/// Returns the path of the ISO.
pub fn create_iso_and_pxe(
    writer: &dyn IsoWriter,
    dirs: &WorkingDirs,
    artifacts: &IsoArtifacts,
    options: &CustomizationOptions,
) -> Result<PathBuf> {
    let Some(initrd) = artifacts.initrd_image.as_deref() else {
        bail!("no initrd image was produced");
    };
    let Some(grub_cfg) = artifacts.iso_grub_cfg.as_deref() else {
        bail!("no grub.cfg was found");
    };
    artifacts.require_bootloaders()?;

    let files = media_files(artifacts, options)?;
    let image_name = options.image_name();
    let request = IsoWriteRequest {
        initrd,
        grub_cfg,
        files: &files,
        output_dir: &options.output_dir,
        image_name: &image_name,
        work_dir: &dirs.iso_writer_dir,
        volume_label: ISO_VOLUME_LABEL,
        enable_bios_boot: false,
        enable_rpm_repo: false,
        resources_dir: None,
    };
    let iso = writer.make(&request).context("failed to generate iso image")?;
    info!("LiveOS iso image: {}", iso.display());

    if let Some(pxe_dir) = options.pxe_artifacts_dir.as_deref() {
        let pxe_supported = artifacts
            .pxe_grub_cfg
            .as_ref()
            .is_some_and(|cfg| cfg.exists());
        if pxe_supported {
            populate_pxe_artifacts_dir(&iso, pxe_dir, &dirs.iso_build_dir)
                .context("failed to populate PXE artifacts folder")?;
        } else {
            info!(
                "not creating PXE artifacts in {}: the image does not support PXE booting",
                pxe_dir.display()
            );
        }
    }

    Ok(iso)
}

/// Expand `iso` into `pxe_dir` laid out for network boot.
///
/// ```text
/// pxe_dir/
///   bootx64.efi, grubx64.efi   (flat, loaded by the firmware over TFTP)
///   boot/grub2/grub.cfg        (the PXE variant)
///   <name>.iso                 (fetched by the initrd)
/// ```
pub fn populate_pxe_artifacts_dir(iso: &Path, pxe_dir: &Path, build_dir: &Path) -> Result<()> {
    info!("creating PXE artifacts in {}", pxe_dir.display());
    extract_iso(iso, pxe_dir, build_dir)?;
    arrange_pxe_tree(iso, pxe_dir)
}

/// Rearrange an expanded ISO in `pxe_dir` for network boot.
fn arrange_pxe_tree(iso: &Path, pxe_dir: &Path) -> Result<()> {
    let grub_dir = pxe_dir.join(GRUB_CFG_DIR);
    let pxe_cfg = grub_dir.join(PXE_GRUB_CFG);
    if !pxe_cfg.is_file() {
        bail!("iso ({}) has no PXE grub configuration", iso.display());
    }
    atomic_move(&pxe_cfg, &grub_dir.join(ISO_GRUB_CFG))
        .context("failed to replace grub.cfg with the PXE grub configuration")?;

    let bootloaders = pxe_dir.join(ISO_BOOTLOADERS_DIR);
    for binary in [BOOTX64_BINARY, GRUBX64_BINARY] {
        atomic_move(&bootloaders.join(binary), &pxe_dir.join(binary))
            .with_context(|| format!("failed to move ({}) to the PXE folder root", binary))?;
    }

    // Remove the whole EFI subtree, not only its boot directory.
    let efi_root = Path::new(ISO_BOOTLOADERS_DIR)
        .components()
        .next()
        .map(|first| pxe_dir.join(first))
        .unwrap_or(bootloaders);
    fs::remove_dir_all(&efi_root)
        .with_context(|| format!("failed to remove ({})", efi_root.display()))?;

    let Some(iso_name) = iso.file_name() else {
        bail!("invalid iso path ({})", iso.display());
    };
    fs::copy(iso, pxe_dir.join(iso_name))
        .with_context(|| format!("failed to copy ({}) to ({})", iso.display(), pxe_dir.display()))?;
    Ok(())
}
