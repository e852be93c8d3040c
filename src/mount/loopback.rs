//! Loop devices and mounts as scoped resources.
//!
//! Both types release their resource in `Drop` on a best-effort basis. Call
//! `close()` on the success path so release failures surface as errors.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::process::{self, Cmd};

/// A loop device attached to an image file.
#[derive(Debug)]
pub struct LoopDevice {
    device: PathBuf,
    attached: bool,
}

impl LoopDevice {
    /// Attach `image` to the first free loop device.
    ///
    /// With `partscan` the kernel exposes partitions as `<device>p<N>`.
    pub fn attach(image: &Path, partscan: bool, read_only: bool) -> Result<Self> {
        let mut cmd = Cmd::new("losetup").args(["--find", "--show"]);
        if partscan {
            cmd = cmd.arg("--partscan");
        }
        if read_only {
            cmd = cmd.arg("--read-only");
        }
        let result = cmd
            .arg_path(image)
            .error_msg(format!("failed to create loop device for ({})", image.display()))
            .run()?;

        let device = result.stdout_trimmed();
        if device.is_empty() {
            bail!("losetup did not report a device for ({})", image.display());
        }
        debug!("attached {} to {}", image.display(), device);

        if partscan {
            settle_devices();
        }

        Ok(Self {
            device: PathBuf::from(device),
            attached: true,
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device
    }

    /// Detach the device, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.attached = false;
        detach(&self.device)
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = detach(&self.device) {
                warn!("failed to detach {}: {:#}", self.device.display(), e);
            }
        }
    }
}

fn detach(device: &Path) -> Result<()> {
    Cmd::new("losetup")
        .arg("--detach")
        .arg_path(device)
        .error_msg(format!("failed to detach loop device ({})", device.display()))
        .run()?;
    debug!("detached {}", device.display());
    Ok(())
}

/// Wait for udev to create partition nodes.
fn settle_devices() {
    if process::exists("udevadm") {
        let _ = Cmd::new("udevadm").arg("settle").allow_fail().run();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}

/// A mounted filesystem.
#[derive(Debug)]
pub struct Mount {
    target: PathBuf,
    mounted: bool,
}

impl Mount {
    /// Mount `source` at `target`, creating the target directory if needed.
    ///
    /// `options` are joined into a single `-o` argument (e.g. `["ro"]`).
    pub fn new(
        source: impl AsRef<Path>,
        target: &Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> Result<Self> {
        let source = source.as_ref();
        std::fs::create_dir_all(target)
            .with_context(|| format!("failed to create mount point ({})", target.display()))?;

        let mut cmd = Cmd::new("mount");
        if let Some(fstype) = fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        if !options.is_empty() {
            cmd = cmd.args(["-o", &options.join(",")]);
        }
        cmd.arg_path(source)
            .arg_path(target)
            .error_msg(format!(
                "failed to mount ({}) at ({})",
                source.display(),
                target.display()
            ))
            .run()?;
        debug!("mounted {} at {}", source.display(), target.display());

        Ok(Self {
            target: target.to_path_buf(),
            mounted: true,
        })
    }

    /// Bind-mount a host directory.
    pub fn bind(source: &Path, target: &Path) -> Result<Self> {
        std::fs::create_dir_all(target)
            .with_context(|| format!("failed to create mount point ({})", target.display()))?;
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .error_msg(format!(
                "failed to bind ({}) at ({})",
                source.display(),
                target.display()
            ))
            .run()?;
        Ok(Self {
            target: target.to_path_buf(),
            mounted: true,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Unmount, reporting failure.
    pub fn close(mut self) -> Result<()> {
        self.mounted = false;
        unmount(&self.target)
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = unmount(&self.target) {
                warn!("failed to unmount {}: {:#}", self.target.display(), e);
            }
        }
    }
}

fn unmount(target: &Path) -> Result<()> {
    Cmd::new("umount")
        .arg_path(target)
        .error_msg(format!("failed to unmount ({})", target.display()))
        .run()?;
    debug!("unmounted {}", target.display());
    Ok(())
}

/// Release a stack of mounts, most recent first, collecting every failure.
pub fn close_mounts(mounts: &mut Vec<Mount>) -> Result<()> {
    let mut failures = Vec::new();
    while let Some(mount) = mounts.pop() {
        if let Err(e) = mount.close() {
            failures.push(format!("{:#}", e));
        }
    }
    if !failures.is_empty() {
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}

/// Mount an image file read-only through its own loop device.
///
/// Fields drop in declaration order, so the mount is released before the
/// loop device it sits on.
#[derive(Debug)]
pub struct LoopMount {
    mount: Option<Mount>,
    loop_device: Option<LoopDevice>,
}

impl LoopMount {
    pub fn read_only(image: &Path, target: &Path, fstype: &str) -> Result<Self> {
        let loop_device = LoopDevice::attach(image, false, true)?;
        let mount = Mount::new(loop_device.device_path(), target, Some(fstype), &["ro"])?;
        Ok(Self {
            mount: Some(mount),
            loop_device: Some(loop_device),
        })
    }

    pub fn target(&self) -> Option<&Path> {
        self.mount.as_ref().map(Mount::target)
    }

    /// Unmount then detach, reporting the first failure.
    pub fn close(mut self) -> Result<()> {
        if let Some(mount) = self.mount.take() {
            mount.close()?;
        }
        if let Some(loop_device) = self.loop_device.take() {
            loop_device.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_mounts_on_empty_stack_is_ok() {
        let mut mounts = Vec::new();
        assert!(close_mounts(&mut mounts).is_ok());
    }

    #[test]
    #[ignore = "requires root and a loop-capable kernel"]
    fn loop_mount_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let image = temp.path().join("fs.img");
        std::fs::File::create(&image).unwrap().set_len(16 * 1024 * 1024).unwrap();
        Cmd::new("mkfs.ext4").arg("-q").arg_path(&image).run().unwrap();

        let target = temp.path().join("mnt");
        let mount = LoopMount::read_only(&image, &target, "ext4").unwrap();
        assert!(target.join("lost+found").exists());
        mount.close().unwrap();

        let mounts = std::fs::read_to_string("/proc/mounts").unwrap();
        assert!(!mounts.contains(target.to_str().unwrap()));
    }
}
