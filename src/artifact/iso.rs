//! Bootable LiveOS ISO assembly.
//!
//! [`IsoWriter`] is the seam between the builder and the tool that encodes
//! the ISO9660 image. The builder hands over the initrd, the ISO grub config
//! and a flat list of [`FileToCopy`] entries; the writer returns the path of
//! the image it produced.
//!
//! [`XorrisoIsoWriter`] is the default implementation. The bootloaders and
//! the kernel are not passed explicitly: they were staged into the initrd and
//! are unpacked from it again here.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use super::filesystem::copy_file_no_dereference;
use super::iso_utils::{create_efi_boot_image, run_xorriso, setup_iso_structure};
use crate::cleanup::prepare_work_dir;
use crate::config::IsoImageName;
use crate::layout::{
    BOOTX64_BINARY, GRUBX64_BINARY, GRUB_CFG_DIR, INITRD_IMAGE, ISO_BOOTLOADERS_DIR, ISO_BOOT_DIR,
    ISO_GRUB_CFG, STAGED_BOOTLOADERS_DIR, VMLINUZ,
};
use crate::process::Cmd;

/// EFI boot image path on the media, relative to its root.
pub const EFIBOOT_MEDIA_PATH: &str = "boot/efiboot.img";

/// One file placed on the media.
///
/// Exactly one of `source` and `content` is set. `destination` is the
/// absolute path on the media.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileToCopy {
    pub source: Option<PathBuf>,
    pub content: Option<String>,
    pub destination: PathBuf,
    pub permissions: Option<u32>,
    /// Copy symlinks as symlinks.
    pub no_dereference: bool,
}

impl FileToCopy {
    pub fn from_source(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.into()),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn from_content(content: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            content: Some(content.into()),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.source, &self.content) {
            (Some(_), Some(_)) => bail!(
                "file for ({}) sets both source and content",
                self.destination.display()
            ),
            (None, None) => bail!(
                "file for ({}) sets neither source nor content",
                self.destination.display()
            ),
            _ => {}
        }
        if self.destination.as_os_str().is_empty() {
            bail!("additional file destination must not be empty");
        }
        if self
            .destination
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            bail!(
                "additional file destination ({}) must not contain '..'",
                self.destination.display()
            );
        }
        Ok(())
    }

    /// Where this file lands under `media_root`.
    pub fn target(&self, media_root: &Path) -> PathBuf {
        let relative = self
            .destination
            .strip_prefix("/")
            .unwrap_or(&self.destination);
        media_root.join(relative)
    }

    /// Write the file into the media tree at `media_root`.
    pub fn materialize(&self, media_root: &Path) -> Result<()> {
        self.validate()?;
        let target = self.target(media_root);
        debug!("placing {} on the media", self.destination.display());

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ({})", parent.display()))?;
        }

        match (&self.source, &self.content) {
            (Some(source), _) if self.no_dereference => {
                copy_file_no_dereference(source, &target)?;
            }
            (Some(source), _) => {
                fs::copy(source, &target).with_context(|| {
                    format!(
                        "failed to copy ({}) to ({})",
                        source.display(),
                        target.display()
                    )
                })?;
            }
            (None, content) => {
                fs::write(&target, content.as_deref().unwrap_or_default())
                    .with_context(|| format!("failed to write ({})", target.display()))?;
            }
        }

        if let Some(mode) = self.permissions {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode)).with_context(|| {
                format!("failed to set permissions on ({})", target.display())
            })?;
        }
        Ok(())
    }
}

/// Everything the ISO writer needs for one image.
#[derive(Debug, Clone)]
pub struct IsoWriteRequest<'a> {
    pub initrd: &'a Path,
    pub grub_cfg: &'a Path,
    pub files: &'a [FileToCopy],
    pub output_dir: &'a Path,
    pub image_name: &'a IsoImageName,
    /// Owned by the writer; deleted and re-created on every call.
    pub work_dir: &'a Path,
    pub volume_label: &'a str,
    pub enable_bios_boot: bool,
    pub enable_rpm_repo: bool,
    pub resources_dir: Option<&'a Path>,
}

pub trait IsoWriter {
    /// Produce the ISO and return its path.
    fn make(&self, request: &IsoWriteRequest) -> Result<PathBuf>;
}

/// UEFI-only ISO writer built on `lsinitrd`, mtools and `xorriso`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorrisoIsoWriter;

impl IsoWriter for XorrisoIsoWriter {
    fn make(&self, request: &IsoWriteRequest) -> Result<PathBuf> {
        if request.enable_bios_boot {
            bail!("BIOS boot is not supported by the xorriso ISO writer");
        }
        if request.enable_rpm_repo || request.resources_dir.is_some() {
            bail!("installer resources are not supported by the xorriso ISO writer");
        }
        for file in request.files {
            file.validate()?;
        }

        let (parent, name) = split_work_dir(request.work_dir)?;
        let work_dir = prepare_work_dir(parent, name)?;

        let unpacked = work_dir.join("initrd-unpacked");
        unpack_initrd(request.initrd, &unpacked)?;

        let iso_root = work_dir.join("iso-root");
        info!("laying out ISO media tree in {}", iso_root.display());
        populate_media_tree(request, &unpacked, &iso_root)?;

        fs::create_dir_all(request.output_dir).with_context(|| {
            format!("failed to create ({})", request.output_dir.display())
        })?;
        let output = request.output_dir.join(request.image_name.file_name());
        if output.exists() {
            fs::remove_file(&output)
                .with_context(|| format!("failed to remove ({})", output.display()))?;
        }

        info!("creating ISO {}", output.display());
        run_xorriso(&iso_root, &output, request.volume_label, EFIBOOT_MEDIA_PATH)?;
        Ok(output)
    }
}

fn split_work_dir(work_dir: &Path) -> Result<(&Path, &str)> {
    let parent = work_dir.parent();
    let name = work_dir.file_name().and_then(|n| n.to_str());
    match (parent, name) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => bail!("invalid ISO writer work directory ({})", work_dir.display()),
    }
}

/// Unpack the initrd into `dest`, exposing the staged `/boot` tree.
fn unpack_initrd(initrd: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create ({})", dest.display()))?;
    let initrd = fs::canonicalize(initrd)
        .with_context(|| format!("failed to find initrd ({})", initrd.display()))?;

    Cmd::new("lsinitrd")
        .arg("--unpack")
        .arg_path(&initrd)
        .dir(dest)
        .error_msg("failed to unpack initrd. Install dracut.")
        .run()?;
    Ok(())
}

fn populate_media_tree(request: &IsoWriteRequest, unpacked: &Path, iso_root: &Path) -> Result<()> {
    setup_iso_structure(iso_root)?;

    let staged = unpacked.join(ISO_BOOT_DIR);
    let staged_bootloaders = staged.join(STAGED_BOOTLOADERS_DIR);
    let shim = staged_bootloaders.join(BOOTX64_BINARY);
    let grub = staged_bootloaders.join(GRUBX64_BINARY);
    let vmlinuz = staged.join(VMLINUZ);
    for required in [&shim, &grub, &vmlinuz] {
        if !required.is_file() {
            bail!(
                "initrd ({}) does not contain ({})",
                request.initrd.display(),
                required.strip_prefix(unpacked).unwrap_or(required).display()
            );
        }
    }

    let boot = iso_root.join(ISO_BOOT_DIR);
    let bootloaders = iso_root.join(ISO_BOOTLOADERS_DIR);
    let grub_dir = iso_root.join(GRUB_CFG_DIR);

    copy(&vmlinuz, &boot.join(VMLINUZ))?;
    copy(request.initrd, &boot.join(INITRD_IMAGE))?;
    copy(&shim, &bootloaders.join(BOOTX64_BINARY))?;
    copy(&grub, &bootloaders.join(GRUBX64_BINARY))?;
    copy(request.grub_cfg, &grub_dir.join(ISO_GRUB_CFG))?;
    // A prefix-less grub reads its config from next to itself.
    copy(request.grub_cfg, &bootloaders.join(ISO_GRUB_CFG))?;

    for file in request.files {
        file.materialize(iso_root)?;
    }

    create_efi_boot_image(
        &iso_root.join(EFIBOOT_MEDIA_PATH),
        &[
            (shim.as_path(), BOOTX64_BINARY),
            (grub.as_path(), GRUBX64_BINARY),
            (request.grub_cfg, ISO_GRUB_CFG),
        ],
    )?;
    Ok(())
}

fn copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy ({}) to ({})", src.display(), dst.display()))?;
    Ok(())
}
