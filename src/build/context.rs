//! Artifacts collected and produced by one LiveOS build.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::dracut::DracutPackageInfo;
use crate::artifact::classify::Slot;
use crate::error::LiveOsError;
use crate::layout::{
    BOOTX64_BINARY, GRUBX64_BINARY, GRUBX64_NOPREFIX_BINARY, GRUB_PACKAGES, PXE_GRUB_CFG,
    SAVED_CONFIGS_DIR, SAVED_CONFIGS_FILE, SHIM_PACKAGE,
};

/// Typed artifact table.
///
/// `None` means "not produced yet" or "not applicable to this run"; for
/// `dracut_package_info` it means no rootfs was inspected (ISO to ISO).
#[derive(Debug, Clone, Default)]
pub struct IsoArtifacts {
    pub kernel_version: Option<String>,
    pub dracut_package_info: Option<DracutPackageInfo>,
    pub bootx64_efi: Option<PathBuf>,
    pub grubx64_efi: Option<PathBuf>,
    pub iso_grub_cfg: Option<PathBuf>,
    pub pxe_grub_cfg: Option<PathBuf>,
    pub saved_configs_file: PathBuf,
    pub vmlinuz: Option<PathBuf>,
    pub initrd_image: Option<PathBuf>,
    pub squashfs_image: Option<PathBuf>,
    /// Local build path -> absolute path on the media.
    pub additional_files: BTreeMap<PathBuf, PathBuf>,
}

impl IsoArtifacts {
    pub fn new(artifacts_dir: &Path) -> Self {
        Self {
            saved_configs_file: saved_configs_path(artifacts_dir),
            ..Default::default()
        }
    }

    /// Store `path` in the slot a classifier picked.
    pub fn record(&mut self, slot: Slot, path: PathBuf) {
        debug!("{:?} -> {}", slot, path.display());
        match slot {
            Slot::Shim => self.bootx64_efi = Some(path),
            Slot::Grub | Slot::GrubNoPrefix => self.grubx64_efi = Some(path),
            Slot::IsoGrubCfg => {
                self.pxe_grub_cfg = path.parent().map(|dir| dir.join(PXE_GRUB_CFG));
                self.iso_grub_cfg = Some(path);
            }
            Slot::Kernel => self.vmlinuz = Some(path),
            Slot::Initrd => self.initrd_image = Some(path),
            Slot::Squashfs => self.squashfs_image = Some(path),
            Slot::SavedConfig => self.saved_configs_file = path,
            Slot::PxeGrubCfg | Slot::EfiBootImage => {}
        }
    }

    pub fn add_additional_file(&mut self, source: PathBuf, media_path: PathBuf) {
        self.additional_files.insert(source, media_path);
    }

    /// Shim and grub are both required to boot the media.
    pub fn require_bootloaders(&self) -> Result<(&Path, &Path)> {
        let shim = self.bootx64_efi.as_deref().ok_or_else(|| LiveOsError::MissingBootloader {
            file: format!("boot efi file ({})", BOOTX64_BINARY),
            packages: SHIM_PACKAGE.to_string(),
        })?;
        let grub = self.grubx64_efi.as_deref().ok_or_else(|| LiveOsError::MissingBootloader {
            file: format!("grub efi file ({} or {})", GRUBX64_BINARY, GRUBX64_NOPREFIX_BINARY),
            packages: GRUB_PACKAGES.to_string(),
        })?;
        Ok((shim, grub))
    }

    /// Add files from an earlier build whose media destination this build
    /// has not produced.
    pub fn carry_over_from(&mut self, input: &IsoArtifacts) {
        for (source, media_path) in &input.additional_files {
            if self.additional_files.values().any(|existing| existing == media_path) {
                debug!("not carrying over {}: already produced", media_path.display());
                continue;
            }
            self.additional_files
                .insert(source.clone(), media_path.clone());
        }
    }
}

pub fn saved_configs_path(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join(SAVED_CONFIGS_DIR).join(SAVED_CONFIGS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grub_cfg_slot_derives_pxe_path() {
        let mut artifacts = IsoArtifacts::new(Path::new("/a"));
        artifacts.record(Slot::IsoGrubCfg, PathBuf::from("/a/boot/grub2/grub.cfg"));
        assert_eq!(artifacts.pxe_grub_cfg, Some(PathBuf::from("/a/boot/grub2/grub-pxe.cfg")));
        assert_eq!(
            artifacts.saved_configs_file,
            PathBuf::from("/a/azl-image-customizer/saved-configs.yaml")
        );
    }

    #[test]
    fn missing_shim_names_package() {
        let mut artifacts = IsoArtifacts::new(Path::new("/a"));
        artifacts.record(Slot::Grub, PathBuf::from("/a/grubx64.efi"));
        let err = artifacts.require_bootloaders().unwrap_err();
        assert!(err.to_string().contains("(shim)"));
    }

    #[test]
    fn missing_grub_names_both_packages() {
        let mut artifacts = IsoArtifacts::new(Path::new("/a"));
        artifacts.record(Slot::Shim, PathBuf::from("/a/bootx64.efi"));
        let msg = artifacts.require_bootloaders().unwrap_err().to_string();
        assert!(msg.contains("grub2-efi-binary"));
        assert!(msg.contains("grub2-efi-binary-noprefix"));

        artifacts.record(Slot::GrubNoPrefix, PathBuf::from("/a/grubx64-noprefix.efi"));
        assert!(artifacts.require_bootloaders().is_ok());
    }

    #[test]
    fn carry_over_never_overwrites() {
        let mut input = IsoArtifacts::new(Path::new("/in"));
        input.add_additional_file("/in/motd".into(), "/motd".into());
        input.add_additional_file("/in/old-font".into(), "/boot/grub2/fonts/unicode.pf2".into());

        let mut output = IsoArtifacts::new(Path::new("/out"));
        output.add_additional_file("/out/new-font".into(), "/boot/grub2/fonts/unicode.pf2".into());
        output.carry_over_from(&input);

        assert_eq!(output.additional_files.len(), 2);
        assert_eq!(
            output.additional_files.get(Path::new("/out/new-font")),
            Some(&PathBuf::from("/boot/grub2/fonts/unicode.pf2"))
        );
        assert!(output.additional_files.contains_key(Path::new("/in/motd")));
    }
}
