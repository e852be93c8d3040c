//! Chroot with the standard virtual filesystems bound in.
//!
//! The process itself never calls `chroot(2)`; commands run through the
//! `chroot` binary, so the build stays single-threaded and the host view is
//! never lost.

use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::loopback::{close_mounts, Mount};
use crate::process::Cmd;

/// An existing directory prepared for running commands inside it.
#[derive(Debug)]
pub struct Chroot {
    root: PathBuf,
    mounts: Vec<Mount>,
}

impl Chroot {
    /// Bind `/dev`, `/dev/pts`, `/proc`, `/sys` and a fresh `/run` into `root`.
    ///
    /// If any mount fails, those already made are released before returning.
    pub fn enter(root: &Path) -> Result<Self> {
        debug!("initializing chroot at {}", root.display());
        let mut chroot = Self {
            root: root.to_path_buf(),
            mounts: Vec::new(),
        };

        chroot
            .mounts
            .push(Mount::new("proc", &root.join("proc"), Some("proc"), &[])?);
        chroot
            .mounts
            .push(Mount::new("sysfs", &root.join("sys"), Some("sysfs"), &[])?);
        chroot
            .mounts
            .push(Mount::bind(Path::new("/dev"), &root.join("dev"))?);
        chroot
            .mounts
            .push(Mount::new("devpts", &root.join("dev/pts"), Some("devpts"), &["gid=5", "mode=620"])?);
        chroot
            .mounts
            .push(Mount::new("tmpfs", &root.join("run"), Some("tmpfs"), &[])?);

        Ok(chroot)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A command that runs `program` inside the chroot.
    pub fn cmd(&self, program: &str) -> Cmd {
        Cmd::new("chroot").arg_path(&self.root).arg(program)
    }

    /// Whether an rpm package is installed in the root.
    ///
    /// Only rpm's own "is not installed" report counts as absent; any other
    /// failure (a broken root, no rpm) is an error.
    pub fn is_package_installed(&self, package: &str) -> Result<bool> {
        let result = self.cmd("rpm").args(["-q", package]).allow_fail().run()?;
        if result.success() {
            return Ok(true);
        }
        if reports_not_installed(&result.stdout, package) {
            return Ok(false);
        }
        bail!(
            "failed to query the ({}) package in ({}) (exit code {}):\n{}",
            package,
            self.root.display(),
            result.code(),
            result.stderr_trimmed()
        );
    }

    /// Query `VERSION` and `RELEASE` of an installed rpm package.
    pub fn query_package_version(&self, package: &str) -> Result<(String, String)> {
        let result = self
            .cmd("rpm")
            .args(["-q", "--queryformat", "%{VERSION} %{RELEASE}\\n", package])
            .error_msg(format!("failed to query the ({}) package version", package))
            .run()?;
        parse_version_release(result.stdout_trimmed())
            .ok_or_else(|| anyhow!("failed to parse rpm query output ({})", result.stdout_trimmed()))
    }

    /// A handle on `root` with nothing mounted.
    #[cfg(test)]
    pub(crate) fn unmounted(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mounts: Vec::new(),
        }
    }

    /// Release every mount, most recent first.
    pub fn close(mut self) -> Result<()> {
        close_mounts(&mut self.mounts)
    }
}

impl Drop for Chroot {
    fn drop(&mut self) {
        // Pop explicitly: a Vec drops its elements front to back.
        while let Some(mount) = self.mounts.pop() {
            drop(mount);
        }
    }
}

/// `rpm -q` output for a package that is simply absent.
fn reports_not_installed(stdout: &str, package: &str) -> bool {
    let expected = format!("package {} is not installed", package);
    stdout.lines().any(|line| line.trim() == expected)
}

fn parse_version_release(output: &str) -> Option<(String, String)> {
    let line = output.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?.to_string();
    let release = parts.next()?.to_string();
    Some((version, release))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rpm_query_output() {
        assert_eq!(
            parse_version_release("102 7.azl3\n"),
            Some(("102".to_string(), "7.azl3".to_string()))
        );
        assert_eq!(parse_version_release("102"), None);
        assert_eq!(parse_version_release(""), None);
    }

    #[test]
    fn cmd_targets_chroot_binary() {
        let chroot = Chroot::unmounted(Path::new("/nonexistent-root"));
        let err = chroot.cmd("true").run().unwrap_err();
        assert!(err.to_string().contains("chroot"));
    }

    #[test]
    fn recognizes_rpm_not_installed_report() {
        assert!(reports_not_installed("package curl is not installed\n", "curl"));
        assert!(!reports_not_installed("package curl-minimal is not installed\n", "curl"));
        assert!(!reports_not_installed("", "curl"));
    }

    #[test]
    fn broken_root_is_an_error_not_a_missing_package() {
        let chroot = Chroot::unmounted(Path::new("/nonexistent-root"));
        let err = chroot.is_package_installed("curl").unwrap_err();
        assert!(err.to_string().contains("curl"));
        assert!(chroot.query_package_version("dracut").is_err());
    }
}
