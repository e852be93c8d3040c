//! Turn a copied root filesystem into a LiveOS root.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::context::IsoArtifacts;
use crate::artifact::classify::{self, Classification, ScanSource, Slot};
use crate::artifact::filesystem::{copy_file_no_dereference, enumerate_files, media_path};
use crate::error::LiveOsError;
use crate::layout::{
    BOOTX64_BINARY, DRACUT_CONFIG, DRACUT_CONFIG_FILE, GRUBX64_BINARY, INITRD_STAGING_DIR,
    ISO_GRUB_CFG, NOPREFIX_GRUB_CFG_DIR, STAGED_BOOTLOADERS_DIR, VMLINUZ,
};

const KERNEL_MODULES_DIR: &str = "usr/lib/modules";

/// The single installed kernel version (`usr/lib/modules/<version>`).
pub fn find_kernel_version(rootfs: &Path) -> Result<String> {
    let modules = rootfs.join(KERNEL_MODULES_DIR);
    let entries = fs::read_dir(&modules)
        .with_context(|| format!("failed to enumerate kernels under ({})", modules.display()))?;

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let mut contents = fs::read_dir(entry.path())?;
        if contents.next().is_some() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    match versions.len() {
        0 => Err(LiveOsError::MissingKernel(format!("/{}", KERNEL_MODULES_DIR)).into()),
        1 => {
            let version = versions.remove(0);
            debug!("found installed kernel version ({})", version);
            Ok(version)
        }
        _ => Err(LiveOsError::MultipleKernels(format!("/{}", KERNEL_MODULES_DIR)).into()),
    }
}

/// Copy `/boot` of `rootfs` into `artifacts_dir/boot`, filling the bootloader,
/// kernel and grub config slots and recording everything else as additional
/// media files.
pub fn extract_boot_dir_files(
    rootfs: &Path,
    artifacts_dir: &Path,
    artifacts: &mut IsoArtifacts,
) -> Result<()> {
    let boot_dir = rootfs.join("boot");
    let files = enumerate_files(&boot_dir).context("failed to scan /boot folder")?;
    let using_noprefix = classify::contains_grub_noprefix(&files);

    for source in files {
        let rootfs_path = media_path(rootfs, &source)?;
        if classify::is_regenerable_boot_file(&rootfs_path.to_string_lossy()) {
            debug!("not copying {}: regenerated", rootfs_path.display());
            continue;
        }

        let mut target = artifacts_dir.join(rootfs_path.strip_prefix("/").unwrap_or(&rootfs_path));
        match classify::classify(rootfs, &source, ScanSource::BootDir) {
            Classification::Recognized(slot) => {
                target = relocate(slot, target, artifacts_dir, using_noprefix);
                copy_file_no_dereference(&source, &target)
                    .context("failed to extract files from under the boot folder")?;
                artifacts.record(slot, target);
            }
            Classification::Opaque(media) => {
                copy_file_no_dereference(&source, &target)
                    .context("failed to extract files from under the boot folder")?;
                artifacts.add_additional_file(target, media);
            }
        }
    }

    artifacts.require_bootloaders()?;
    Ok(())
}

/// Where a recognized boot file lands in the artifacts tree.
fn relocate(slot: Slot, target: PathBuf, artifacts_dir: &Path, using_noprefix: bool) -> PathBuf {
    match slot {
        Slot::IsoGrubCfg if using_noprefix => artifacts_dir.join(NOPREFIX_GRUB_CFG_DIR).join(ISO_GRUB_CFG),
        Slot::Kernel => target.with_file_name(VMLINUZ),
        _ => target,
    }
}

/// Stage the bootloaders and kernel under the directory dracut embeds into
/// the initrd.
pub fn stage_initrd_artifacts(rootfs: &Path, artifacts: &IsoArtifacts) -> Result<()> {
    let (shim, grub) = artifacts.require_bootloaders()?;
    let Some(vmlinuz) = artifacts.vmlinuz.as_deref() else {
        bail!("no kernel image (vmlinuz-*) was found under /boot");
    };

    let staging = rootfs.join(INITRD_STAGING_DIR);
    let bootloaders = staging.join(STAGED_BOOTLOADERS_DIR);
    fs::create_dir_all(&bootloaders)
        .with_context(|| format!("failed to create ({})", bootloaders.display()))?;

    fs::copy(shim, bootloaders.join(BOOTX64_BINARY))
        .with_context(|| format!("failed to stage bootloader file ({})", BOOTX64_BINARY))?;
    fs::copy(grub, bootloaders.join(GRUBX64_BINARY))
        .with_context(|| format!("failed to stage bootloader file ({})", GRUBX64_BINARY))?;
    fs::copy(vmlinuz, staging.join(VMLINUZ)).context("failed to stage vmlinuz")?;
    Ok(())
}

/// Drop the static mount table and configure dracut for a portable live
/// initrd.
pub fn prepare_rootfs_for_dracut(rootfs: &Path) -> Result<()> {
    let fstab = rootfs.join("etc/fstab");
    debug!("deleting {}", fstab.display());
    fs::remove_file(&fstab).with_context(|| format!("failed to delete ({})", fstab.display()))?;

    let config = rootfs.join(DRACUT_CONFIG_FILE);
    if let Some(parent) = config.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }
    fs::write(&config, DRACUT_CONFIG)
        .with_context(|| format!("failed to create ({})", config.display()))?;
    Ok(())
}
