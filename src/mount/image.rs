//! Full disk image connection.
//!
//! Attaches a disk image to a partition-scanned loop device, finds the
//! partition holding the root filesystem and mounts it together with every
//! other filesystem its fstab names. Everything is read-only.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::fstab::{self, BlockDevice};
use super::loopback::{close_mounts, LoopDevice, Mount};
use crate::process::Cmd;

/// Filesystems a root partition may use.
const ROOTFS_TYPES: &[&str] = &["ext4", "xfs", "btrfs"];

/// On-disk format of an input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    Vhdx,
}

impl ImageFormat {
    /// Guess the format from the file extension. Unknown extensions are raw.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("qcow2") => Self::Qcow2,
            Some("vhd") => Self::Vhd,
            Some("vhdx") => Self::Vhdx,
            _ => Self::Raw,
        }
    }

    /// Format name understood by `qemu-img`.
    pub fn qemu_name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vhd => "vpc",
            Self::Vhdx => "vhdx",
        }
    }
}

/// Convert `image` to a raw image under `build_dir` if it is not raw already.
///
/// Returns the path to use and whether it is a temporary conversion.
pub fn ensure_raw(image: &Path, build_dir: &Path) -> Result<(PathBuf, bool)> {
    let format = ImageFormat::from_path(image);
    if format == ImageFormat::Raw {
        return Ok((image.to_path_buf(), false));
    }

    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let raw = build_dir.join(format!("{}.raw", stem));
    info!("converting {} image {} to raw", format.qemu_name(), image.display());
    Cmd::new("qemu-img")
        .args(["convert", "-f", format.qemu_name(), "-O", "raw"])
        .arg_path(image)
        .arg_path(&raw)
        .error_msg(format!("failed to convert ({}) to a raw image", image.display()))
        .run()?;
    Ok((raw, true))
}

/// A disk image mounted as a read-only root tree.
#[derive(Debug)]
pub struct ImageConnection {
    root_dir: PathBuf,
    mounts: Vec<Mount>,
    loop_device: Option<LoopDevice>,
    converted_image: Option<PathBuf>,
}

impl ImageConnection {
    /// Connect to `image`, mounting its root at `<build_dir>/<mount_dir_name>`.
    pub fn connect(image: &Path, build_dir: &Path, mount_dir_name: &str) -> Result<Self> {
        fs::create_dir_all(build_dir)
            .with_context(|| format!("failed to create folder ({})", build_dir.display()))?;

        let (raw_image, converted) = ensure_raw(image, build_dir)?;
        let mut connection = Self {
            root_dir: build_dir.join(mount_dir_name),
            mounts: Vec::new(),
            loop_device: None,
            converted_image: converted.then(|| raw_image.clone()),
        };

        let loop_device = LoopDevice::attach(&raw_image, true, true)?;
        let partitions = fstab::list_partitions(loop_device.device_path())?;
        connection.loop_device = Some(loop_device);

        let root_mount = mount_rootfs(&partitions, &connection.root_dir)
            .with_context(|| format!("failed to find the root partition of ({})", image.display()))?;
        connection.mounts.push(root_mount);

        let fstab_path = connection.root_dir.join("etc/fstab");
        let text = fs::read_to_string(&fstab_path)
            .with_context(|| format!("failed to read ({})", fstab_path.display()))?;
        for entry in ordered_mounts(&fstab::parse_fstab(&text)) {
            let partition = fstab::resolve_spec(&entry.spec, &partitions).with_context(|| {
                format!(
                    "failed to find partition ({}) for mount point ({})",
                    entry.spec, entry.mount_point
                )
            })?;
            let target = fstab::mount_target(&connection.root_dir, &entry.mount_point);
            let fstype = (entry.fstype != "auto").then_some(entry.fstype.as_str());
            debug!("mounting {} at {}", partition.name, entry.mount_point);
            connection
                .mounts
                .push(Mount::new(&partition.name, &target, fstype, &["ro"])?);
        }

        Ok(connection)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Unmount everything, detach the loop device and drop any converted copy.
    pub fn close(mut self) -> Result<()> {
        close_mounts(&mut self.mounts)?;
        if let Some(loop_device) = self.loop_device.take() {
            loop_device.close()?;
        }
        if let Some(converted) = self.converted_image.take() {
            fs::remove_file(&converted)
                .with_context(|| format!("failed to remove ({})", converted.display()))?;
        }
        Ok(())
    }
}

impl Drop for ImageConnection {
    fn drop(&mut self) {
        while let Some(mount) = self.mounts.pop() {
            drop(mount);
        }
        self.loop_device.take();
        if let Some(converted) = self.converted_image.take() {
            if let Err(e) = fs::remove_file(&converted) {
                warn!("failed to remove {}: {}", converted.display(), e);
            }
        }
    }
}

/// Mount the first partition that looks like a root filesystem.
fn mount_rootfs(partitions: &[BlockDevice], target: &Path) -> Result<Mount> {
    for partition in partitions {
        let Some(fstype) = partition.fstype.as_deref() else {
            continue;
        };
        if !ROOTFS_TYPES.contains(&fstype) {
            continue;
        }

        let mount = Mount::new(&partition.name, target, Some(fstype), &["ro"])?;
        if target.join("etc/fstab").is_file() {
            debug!("found rootfs on {}", partition.name);
            return Ok(mount);
        }
        mount.close()?;
    }
    bail!("no partition contains an /etc/fstab")
}

/// Mountable fstab entries other than `/`, parents before children.
fn ordered_mounts(entries: &[fstab::FstabEntry]) -> Vec<&fstab::FstabEntry> {
    let mut mounts: Vec<_> = entries
        .iter()
        .filter(|e| e.is_mountable() && e.mount_point != "/")
        .collect();
    mounts.sort_by_key(|e| e.depth());
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(ImageFormat::from_path(Path::new("a.qcow2")), ImageFormat::Qcow2);
        assert_eq!(ImageFormat::from_path(Path::new("a.VHDX")), ImageFormat::Vhdx);
        assert_eq!(ImageFormat::from_path(Path::new("a.vhd")).qemu_name(), "vpc");
        assert_eq!(ImageFormat::from_path(Path::new("a.img")), ImageFormat::Raw);
        assert_eq!(ImageFormat::from_path(Path::new("disk")), ImageFormat::Raw);
    }

    #[test]
    fn raw_images_are_used_in_place() {
        let (path, converted) = ensure_raw(Path::new("/images/disk.raw"), Path::new("/build")).unwrap();
        assert_eq!(path, PathBuf::from("/images/disk.raw"));
        assert!(!converted);
    }

    #[test]
    fn mounts_are_ordered_by_depth() {
        let entries = fstab::parse_fstab(
            "UUID=a /boot/efi vfat umask=0077 0 2\nUUID=b / ext4 defaults 0 1\nUUID=c /boot ext4 defaults 0 2\nUUID=d none swap sw 0 0\n",
        );
        let points: Vec<_> = ordered_mounts(&entries)
            .iter()
            .map(|e| e.mount_point.as_str())
            .collect();
        assert_eq!(points, vec!["/boot", "/boot/efi"]);
    }
}
