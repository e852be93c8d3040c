//! Fixed names and paths shared by the builder, the grub rewriter and the
//! ISO writer.

/// UEFI shim, provided by the `shim` package.
pub const BOOTX64_BINARY: &str = "bootx64.efi";
/// Grub EFI binary, provided by `grub2-efi-binary`.
pub const GRUBX64_BINARY: &str = "grubx64.efi";
/// Prefix-less grub, provided by `grub2-efi-binary-noprefix`.
pub const GRUBX64_NOPREFIX_BINARY: &str = "grubx64-noprefix.efi";

pub const SHIM_PACKAGE: &str = "(shim)";
pub const GRUB_PACKAGES: &str = "either the (grub2-efi-binary) or the (grub2-efi-binary-noprefix)";

/// Grub configuration directory on the media (and in `/boot`).
pub const GRUB_CFG_DIR: &str = "boot/grub2";
pub const ISO_GRUB_CFG: &str = "grub.cfg";
pub const PXE_GRUB_CFG: &str = "grub-pxe.cfg";
/// Where a prefix-less grub looks for its configuration, relative to the
/// artifacts root.
pub const NOPREFIX_GRUB_CFG_DIR: &str = "EFI/BOOT";

pub const ISO_KERNEL_PATH: &str = "/boot/vmlinuz";
pub const ISO_INITRD_PATH: &str = "/boot/initrd.img";
pub const ISO_BOOT_DIR: &str = "boot";
/// Bootloader directory on the media.
pub const ISO_BOOTLOADERS_DIR: &str = "efi/boot";

pub const VMLINUZ_PREFIX: &str = "vmlinuz-";
pub const VMLINUZ: &str = "vmlinuz";
pub const INITRD_IMAGE: &str = "initrd.img";

pub const LIVEOS_DIR: &str = "liveos";
pub const LIVEOS_IMAGE: &str = "rootfs.img";

/// Saved configuration location on the media and in the artifacts tree.
pub const SAVED_CONFIGS_DIR: &str = "azl-image-customizer";
pub const SAVED_CONFIGS_FILE: &str = "saved-configs.yaml";

/// Volume label the ISO writer stamps on every image.
pub const ISO_VOLUME_LABEL: &str = "CDROM";

/// Kernel arguments that make dracut boot the squashfs with an overlay.
pub const LIVEOS_KERNEL_ARGS: &str = " rd.shell rd.live.image rd.live.dir=liveos rd.live.squashimg=rootfs.img rd.live.overlay=1 rd.live.overlay.overlayfs rd.live.overlay.nouserconfirmprompt ";
pub const PXE_KERNEL_ARGS: &str = "ip=dhcp rd.live.azldownloader=enable";

/// Directory inside the writeable rootfs holding files that dracut embeds
/// into the initrd.
pub const INITRD_STAGING_DIR: &str = "boot-staging";
/// Where the staged files land inside the initrd.
pub const INITRD_ARTIFACTS_DIR: &str = "/boot";
/// Bootloader sub-path under the staging directory.
pub const STAGED_BOOTLOADERS_DIR: &str = "efi/EFI/BOOT";

pub const DRACUT_CONFIG_FILE: &str = "etc/dracut.conf.d/20-live-cd.conf";
pub const DRACUT_CONFIG: &str = "add_dracutmodules+=\" dmsquash-live livenet \"\nadd_drivers+=\" overlay \"\nhostonly=\"no\"\n";

/// Packages the live initrd needs inside the rootfs.
pub const INITRD_REQUIRED_PACKAGES: &[&str] = &["squashfs-tools", "tar", "device-mapper", "curl"];

pub const EXPANSION_SAFETY_FACTOR: f64 = 1.5;

pub const ESP_START_MIB: u64 = 1;
pub const ESP_END_MIB: u64 = 9;
pub const ESP_MOUNT_POINT: &str = "/boot/efi";

/// Base URL written into the PXE grub config when no PXE target was given,
/// so operators can find and replace it.
pub const PXE_IMAGE_BASE_URL_PLACEHOLDER: &str = "http://pxe-image-base-url-place-holder";
