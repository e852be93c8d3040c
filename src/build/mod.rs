//! LiveOS build steps that work on a copied root filesystem.
//!
//! - [`context`] - the artifact table of one build
//! - [`dracut`] - dracut version detection and the PXE capability check
//! - [`rootfs`] - kernel detection, `/boot` extraction and dracut preparation

pub mod context;
pub mod dracut;
pub mod rootfs;
