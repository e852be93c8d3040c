//! LiveOS ISO builder.
//!
//! Converts a full OS disk image into a bootable, read-only LiveOS ISO, and
//! re-derives ISOs, PXE artifact trees or writeable disk images from an ISO
//! it produced earlier.
//!
//! # Architecture
//!
//! ```text
//! liveos (orchestration: full image -> ISO, ISO -> ISO, ISO -> disk)
//!     │
//!     ├── mount     loop devices, mounts, chroot, full image connection
//!     ├── build     artifact table, /boot extraction, rootfs preparation
//!     ├── grub      grub.cfg rewriting (ISO and PXE variants)
//!     ├── saved_config  options persisted on the media across builds
//!     └── artifact  squashfs, initrd, ISO writer, writeable disk images
//! ```
//!
//! Everything that touches block devices needs root. External tools run
//! through [`process::Cmd`]; see [`preflight`] for the list.

pub mod artifact;
pub mod build;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod grub;
pub mod layout;
pub mod liveos;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod saved_config;

pub use config::{BuildConfig, CustomizationOptions, IsoImageName, PxeTarget};
pub use error::LiveOsError;
