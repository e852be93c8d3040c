//! Artifact builders for LiveOS media.
//!
//! - [`classify`] - tag well-known boot and media files
//! - [`filesystem`] - file enumeration and copying
//! - [`squashfs`] - the LiveOS root image (mksquashfs)
//! - [`initramfs`] - the live initrd (dracut in a chroot)
//! - [`iso`] - the ISO writer seam and its xorriso implementation
//! - [`iso_utils`] - media layout, EFI boot image and xorriso helpers
//! - [`disk`] - writeable GPT disk images rebuilt from a squashfs

pub mod classify;
pub mod disk;
pub mod filesystem;
pub mod initramfs;
pub mod iso;
pub mod iso_utils;
pub mod squashfs;
