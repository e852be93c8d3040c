//! LiveOS and PXE grub configuration derivation.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{
    append_kernel_args_all, disable_selinux_all, is_mkconfig_config, remove_commands,
    replace_kernel_arg_all, replace_search_commands, replace_token, set_all_paths,
    set_first_path, INITRD_COMMANDS, LINUX_COMMANDS, SEARCH_COMMAND,
};
use crate::build::dracut;
use crate::config::{IsoImageName, PxeTarget};
use crate::layout::{
    ISO_INITRD_PATH, ISO_KERNEL_PATH, ISO_VOLUME_LABEL, LIVEOS_KERNEL_ARGS, PXE_IMAGE_BASE_URL_PLACEHOLDER,
    PXE_KERNEL_ARGS,
};
use crate::saved_config::SavedConfigs;

/// Rewrite a grub config extracted from a full image (or a previous ISO) so it
/// boots the LiveOS media.
pub fn rewrite_iso_grub_cfg(content: &str, extra_command_line: &str) -> Result<String> {
    let search = format!("search --label {} --set root", ISO_VOLUME_LABEL);
    let content = replace_search_commands(content, &search);

    let content = if is_mkconfig_config(&content) {
        let content = set_all_paths(&content, LINUX_COMMANDS, ISO_KERNEL_PATH)
            .context("failed to update the kernel file path in the iso grub.cfg")?;
        set_all_paths(&content, INITRD_COMMANDS, ISO_INITRD_PATH)
            .context("failed to update the initrd file path in the iso grub.cfg")?
    } else {
        // Find the old path once, then replace every occurrence of it. Other
        // entries and variables may reference the same path.
        let (content, old_kernel) = set_first_path(&content, LINUX_COMMANDS, ISO_KERNEL_PATH)
            .context("failed to update the kernel file path in the iso grub.cfg")?;
        let content = replace_token(&content, &old_kernel, ISO_KERNEL_PATH);

        let (content, old_initrd) = set_first_path(&content, INITRD_COMMANDS, ISO_INITRD_PATH)
            .context("failed to update the initrd file path in the iso grub.cfg")?;
        replace_token(&content, &old_initrd, ISO_INITRD_PATH)
    };

    let root = format!("live:LABEL={}", ISO_VOLUME_LABEL);
    let content = replace_kernel_arg_all(&content, "root", &root)
        .context("failed to update the root kernel argument in the iso grub.cfg")?;

    let content = disable_selinux_all(&content).context("failed to set SELinux mode")?;

    let args = format!("{} {}", LIVEOS_KERNEL_ARGS, extra_command_line);
    append_kernel_args_all(&content, &args).context(
        "failed to update the kernel arguments with the LiveOS configuration and user configuration in the iso grub.cfg",
    )
}

/// URL PXE clients download the ISO from.
///
/// A full file URL is used as is; a base URL gets the image file name
/// appended.
pub fn pxe_image_url(pxe: &PxeTarget, image_name: &IsoImageName) -> Result<String> {
    pxe.validate()?;
    if !pxe.iso_image_file_url.is_empty() {
        return Ok(pxe.iso_image_file_url.clone());
    }
    let base = if pxe.iso_image_base_url.is_empty() {
        PXE_IMAGE_BASE_URL_PLACEHOLDER
    } else {
        pxe.iso_image_base_url.as_str()
    };
    Ok(format!("{}/{}", base.trim_end_matches('/'), image_name.file_name()))
}

/// Derive the PXE grub config from an already rewritten ISO grub config.
pub fn derive_pxe_grub_cfg(iso_content: &str, pxe: &PxeTarget, image_name: &IsoImageName) -> Result<String> {
    let content = remove_commands(iso_content, SEARCH_COMMAND);

    let url = pxe_image_url(pxe, image_name)?;
    let content = replace_kernel_arg_all(&content, "root", &format!("live:{}", url))
        .context("failed to update the root kernel argument with the PXE iso image url in the PXE grub.cfg")?;

    append_kernel_args_all(&content, PXE_KERNEL_ARGS)
        .with_context(|| format!("failed to append the kernel arguments ({}) in the PXE grub.cfg", PXE_KERNEL_ARGS))
}

/// Rewrite the ISO grub config in place and, when the recorded dracut can
/// boot over the network, write the PXE variant to `pxe_cfg_path`.
///
/// Returns whether the PXE config was written. A dracut too old for PXE is
/// not an error: the ISO is still built.
pub fn update_grub_cfg(
    iso_cfg_path: &Path,
    pxe_cfg_path: &Path,
    saved: &SavedConfigs,
    image_name: &IsoImageName,
) -> Result<bool> {
    let content = fs::read_to_string(iso_cfg_path)
        .with_context(|| format!("failed to read ({})", iso_cfg_path.display()))?;

    let iso_content = rewrite_iso_grub_cfg(&content, &saved.iso.kernel_command_line.extra_command_line)?;
    fs::write(iso_cfg_path, &iso_content)
        .with_context(|| format!("failed to write ({})", iso_cfg_path.display()))?;

    if let Err(e) = dracut::verify_pxe_support(saved.os.dracut_package_info.as_ref()) {
        info!("cannot generate grub.cfg for PXE booting: {:#}", e);
        if pxe_cfg_path.exists() {
            fs::remove_file(pxe_cfg_path)
                .with_context(|| format!("failed to remove stale ({})", pxe_cfg_path.display()))?;
        }
        return Ok(false);
    }

    let pxe_content = derive_pxe_grub_cfg(&iso_content, &saved.pxe_target(), image_name)
        .context("failed to create grub configuration for PXE booting")?;
    fs::write(pxe_cfg_path, pxe_content)
        .with_context(|| format!("failed to write ({})", pxe_cfg_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::dracut::DracutPackageInfo;
    use crate::saved_config::{SavedKernelCommandLine, SavedOs, SavedPxe};
    use tempfile::TempDir;

    const DIRECT: &str = "\
set timeout=0
search -n -u 7a1b -s
menuentry \"Azure Linux\" {
\tlinux /old/vmlinuz root=PARTUUID=1111 ro selinux=1 console=tty0
\tinitrd /old/initrd.img
}
menuentry \"Azure Linux (recovery)\" {
\tlinux /old/vmlinuz root=PARTUUID=1111 ro single
\tinitrd /old/initrd.img
}
";

    const MKCONFIG: &str = "\
### BEGIN /etc/grub.d/10_linux ###
menuentry 'A' {
\tsearch --no-floppy --fs-uuid --set=root 1234
\tlinux /vmlinuz-6.6.1 root=UUID=1234 ro
\tinitrd /initramfs-6.6.1.img
}
menuentry 'B' {
\tlinux /vmlinuz-6.5.0 root=UUID=1234 ro
\tinitrd /initramfs-6.5.0.img
}
### END /etc/grub.d/10_linux ###
";

    fn image() -> IsoImageName {
        IsoImageName::from_base_name("myimage")
    }

    #[test]
    fn direct_config_rewrites_every_entry() {
        let out = rewrite_iso_grub_cfg(DIRECT, "console=ttyS0").unwrap();
        assert!(!out.contains("/old/vmlinuz"));
        assert!(!out.contains("/old/initrd.img"));
        assert_eq!(out.matches("linux /boot/vmlinuz ").count(), 2);
        assert_eq!(out.matches("initrd /boot/initrd.img").count(), 2);
        assert_eq!(out.matches("root=live:LABEL=CDROM").count(), 2);
        assert!(out.contains("search --label CDROM --set root"));
        assert!(!out.contains("selinux=1"));
        assert_eq!(out.matches("selinux=0").count(), 2);
        assert_eq!(out.matches("rd.live.squashimg=rootfs.img").count(), 2);
        assert!(out.contains("rd.live.overlay.nouserconfirmprompt console=ttyS0\n"));
    }

    #[test]
    fn mkconfig_config_rewrites_each_command() {
        let out = rewrite_iso_grub_cfg(MKCONFIG, "").unwrap();
        assert!(!out.contains("vmlinuz-6"));
        assert!(!out.contains("initramfs-"));
        assert_eq!(out.matches("linux /boot/vmlinuz ").count(), 2);
        assert!(out.contains("\tsearch --label CDROM --set root\n"));
    }

    #[test]
    fn config_without_root_arg_fails() {
        let cfg = "menuentry x {\n linux /vmlinuz ro\n initrd /initrd\n}\n";
        assert!(rewrite_iso_grub_cfg(cfg, "").is_err());
        assert!(rewrite_iso_grub_cfg("set timeout=0\n", "").is_err());
    }

    #[test]
    fn pxe_url_from_base_url() {
        let pxe = PxeTarget {
            iso_image_base_url: "http://host/liveos".into(),
            ..Default::default()
        };
        assert_eq!(pxe_image_url(&pxe, &image()).unwrap(), "http://host/liveos/myimage.iso");

        let pxe = PxeTarget {
            iso_image_base_url: "http://host/liveos/".into(),
            ..Default::default()
        };
        assert_eq!(pxe_image_url(&pxe, &image()).unwrap(), "http://host/liveos/myimage.iso");

        let pxe = PxeTarget {
            iso_image_file_url: "http://host/x.iso".into(),
            ..Default::default()
        };
        assert_eq!(pxe_image_url(&pxe, &image()).unwrap(), "http://host/x.iso");

        assert!(pxe_image_url(&PxeTarget::default(), &image())
            .unwrap()
            .starts_with(PXE_IMAGE_BASE_URL_PLACEHOLDER));
    }

    #[test]
    fn pxe_config_derives_from_iso_config() {
        let iso = rewrite_iso_grub_cfg(DIRECT, "").unwrap();
        let pxe = PxeTarget {
            iso_image_base_url: "http://host/liveos".into(),
            ..Default::default()
        };
        let out = derive_pxe_grub_cfg(&iso, &pxe, &image()).unwrap();
        assert!(!out.contains("search"));
        assert_eq!(out.matches("root=live:http://host/liveos/myimage.iso").count(), 2);
        assert_eq!(out.matches("ip=dhcp rd.live.azldownloader=enable").count(), 2);
    }

    fn saved(info: Option<DracutPackageInfo>) -> SavedConfigs {
        SavedConfigs {
            iso: crate::saved_config::SavedIso {
                kernel_command_line: SavedKernelCommandLine {
                    extra_command_line: "quiet".into(),
                },
            },
            pxe: SavedPxe {
                iso_image_file_url: "http://h/a.iso".into(),
                ..Default::default()
            },
            os: SavedOs {
                dracut_package_info: info,
            },
        }
    }

    #[test]
    fn update_writes_pxe_only_when_supported() {
        let temp = TempDir::new().unwrap();
        let iso_cfg = temp.path().join("grub.cfg");
        let pxe_cfg = temp.path().join("grub-pxe.cfg");

        fs::write(&iso_cfg, DIRECT).unwrap();
        assert!(!update_grub_cfg(&iso_cfg, &pxe_cfg, &saved(None), &image()).unwrap());
        assert!(!pxe_cfg.exists());
        assert!(fs::read_to_string(&iso_cfg).unwrap().contains("quiet"));

        fs::write(&iso_cfg, DIRECT).unwrap();
        let info = DracutPackageInfo {
            package_version: "102".into(),
            package_release: "7.azl3".into(),
        };
        assert!(update_grub_cfg(&iso_cfg, &pxe_cfg, &saved(Some(info)), &image()).unwrap());
        assert!(fs::read_to_string(&pxe_cfg).unwrap().contains("root=live:http://h/a.iso"));
    }
}
