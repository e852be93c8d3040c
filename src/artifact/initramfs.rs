//! Live initrd generation with dracut inside the LiveOS root.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cleanup::merge_cleanup_error;
use crate::error::LiveOsError;
use crate::mount::chroot::Chroot;

/// Path of the generated initrd inside the chroot.
const INITRD_PATH_IN_CHROOT: &str = "initrd.img";

/// Options for one dracut run.
#[derive(Debug, Clone)]
pub struct DracutOptions<'a> {
    /// Kernel the initrd is built for (`usr/lib/modules/<version>`).
    pub kernel_version: &'a str,
    /// Filesystems dracut must be able to mount.
    pub filesystems: &'a [&'a str],
    /// Directory in the root to embed (absolute inside the chroot).
    pub include_source: &'a str,
    /// Where the included directory lands inside the initrd.
    pub include_target: &'a str,
    /// Packages that must be installed in the root first.
    pub required_packages: &'a [&'a str],
}

/// Run dracut inside `rootfs` and copy the initrd to `output`.
///
/// The chroot (with `/proc`, `/sys` and `/dev` bound in) is released before
/// returning, on success and on failure.
pub fn build_initrd(rootfs: &Path, output: &Path, options: &DracutOptions) -> Result<PathBuf> {
    info!("generating initrd for kernel {}", options.kernel_version);

    let chroot = Chroot::enter(rootfs)
        .with_context(|| format!("failed to initialize chroot for ({})", rootfs.display()))?;

    let result = run_dracut(&chroot, output, options);
    merge_cleanup_error(result, chroot.close())
}

fn run_dracut(chroot: &Chroot, output: &Path, options: &DracutOptions) -> Result<PathBuf> {
    check_required_packages(chroot, options.required_packages)?;

    chroot
        .cmd("dracut")
        .arg(format!("/{}", INITRD_PATH_IN_CHROOT))
        .arg("--force")
        .args(["--kver", options.kernel_version])
        .arg("--filesystems")
        .arg(options.filesystems.join(" "))
        .args(["--include", options.include_source, options.include_target])
        .error_msg("failed to run dracut")
        .run_interactive()?;

    let generated = chroot.root().join(INITRD_PATH_IN_CHROOT);
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ({})", parent.display()))?;
    }
    fs::copy(&generated, output).context("failed to copy generated initrd")?;
    fs::remove_file(&generated)
        .with_context(|| format!("failed to remove ({})", generated.display()))?;
    Ok(output.to_path_buf())
}

/// Fail on the first package from `required` missing in the chroot.
pub fn check_required_packages(chroot: &Chroot, required: &[&str]) -> Result<()> {
    for package in required {
        debug!("checking if ({}) is installed", package);
        if !chroot.is_package_installed(package)? {
            return Err(LiveOsError::MissingPackage {
                package: package.to_string(),
                required: required.iter().map(|p| p.to_string()).collect(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_required_packages_is_ok() {
        let chroot = Chroot::unmounted(Path::new("/nonexistent"));
        assert!(check_required_packages(&chroot, &[]).is_ok());
    }

    #[test]
    fn unusable_root_is_not_reported_as_missing_package() {
        let chroot = Chroot::unmounted(Path::new("/nonexistent-root"));
        let err = check_required_packages(&chroot, &["curl", "tar"]).unwrap_err();
        assert!(err.downcast_ref::<LiveOsError>().is_none(), "unexpected: {:#}", err);
    }
}
