//! Scoped block-device and filesystem resources.
//!
//! - [`loopback`] - loop devices and mounts released on drop
//! - [`chroot`] - a root directory with `/proc`, `/sys` and `/dev` bound in
//! - [`fstab`] - fstab parsing and partition lookup
//! - [`image`] - a full disk image mounted as a read-only root tree

pub mod chroot;
pub mod fstab;
pub mod image;
pub mod loopback;

pub use chroot::Chroot;
pub use image::ImageConnection;
pub use loopback::{LoopDevice, LoopMount, Mount};
