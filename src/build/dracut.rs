//! dracut package detection and the PXE capability check.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::cleanup::merge_cleanup_error;
use crate::error::LiveOsError;
use crate::mount::chroot::Chroot;

/// First dracut version whose `livenet` module can download a whole ISO.
pub const PXE_MIN_DRACUT_VERSION: u64 = 102;
/// First release of [`PXE_MIN_DRACUT_VERSION`] carrying that support.
pub const PXE_MIN_DRACUT_RELEASE: u64 = 7;

/// Installed dracut package, as recorded in saved configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DracutPackageInfo {
    pub package_version: String,
    pub package_release: String,
}

impl DracutPackageInfo {
    /// Query the dracut package installed in `rootfs`.
    ///
    /// rpm runs in a chroot with the virtual filesystems bound in, released
    /// before returning.
    pub fn detect(rootfs: &Path) -> Result<Self> {
        let chroot = Chroot::enter(rootfs)
            .with_context(|| format!("failed to initialize chroot for ({})", rootfs.display()))?;
        let queried = chroot.query_package_version("dracut");
        let (package_version, package_release) = merge_cleanup_error(queried, chroot.close())?;
        debug!("found dracut {}-{}", package_version, package_release);
        Ok(Self {
            package_version,
            package_release,
        })
    }

    pub fn supports_pxe(&self) -> bool {
        let version = leading_number(&self.package_version);
        let release = leading_number(&self.package_release);
        match (version, release) {
            (Some(v), _) if v > PXE_MIN_DRACUT_VERSION => true,
            (Some(v), Some(r)) if v == PXE_MIN_DRACUT_VERSION => r >= PXE_MIN_DRACUT_RELEASE,
            _ => false,
        }
    }
}

impl std::fmt::Display for DracutPackageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dracut-{}-{}", self.package_version, self.package_release)
    }
}

/// Fail unless `info` names a dracut able to boot an ISO over the network.
///
/// `None` means no rootfs was ever inspected in this ISO lineage.
pub fn verify_pxe_support(info: Option<&DracutPackageInfo>) -> Result<()> {
    let minimum = format!("dracut-{}-{}", PXE_MIN_DRACUT_VERSION, PXE_MIN_DRACUT_RELEASE);
    match info {
        Some(info) if info.supports_pxe() => Ok(()),
        Some(info) => Err(LiveOsError::PxeUnsupported {
            found: info.to_string(),
            minimum,
        }
        .into()),
        None => Err(LiveOsError::PxeUnsupported {
            found: "unknown".to_string(),
            minimum,
        }
        .into()),
    }
}

/// Leading decimal digits of `s` (`"7.azl3"` -> 7, `"102.1"` -> 102).
fn leading_number(s: &str) -> Option<u64> {
    let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: &str, release: &str) -> DracutPackageInfo {
        DracutPackageInfo {
            package_version: version.into(),
            package_release: release.into(),
        }
    }

    #[test]
    fn pxe_threshold() {
        assert!(info("102", "7.azl3").supports_pxe());
        assert!(info("102", "11.azl3").supports_pxe());
        assert!(info("103", "1").supports_pxe());
        assert!(info("105.1", "1.azl3").supports_pxe());
        assert!(!info("102", "6.azl3").supports_pxe());
        assert!(!info("059", "20.cm2").supports_pxe());
        assert!(!info("garbage", "7").supports_pxe());
    }

    #[test]
    fn verify_reports_found_and_minimum() {
        let old = info("102", "4.azl3");
        let err = verify_pxe_support(Some(&old)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dracut-102-4.azl3"));
        assert!(msg.contains("dracut-102-7"));

        assert!(verify_pxe_support(None).is_err());
        assert!(verify_pxe_support(Some(&info("102", "7"))).is_ok());
    }

    #[test]
    #[ignore = "requires root"]
    fn detect_releases_its_chroot() {
        let temp = tempfile::TempDir::new().unwrap();
        for dir in ["proc", "sys", "dev", "run"] {
            std::fs::create_dir_all(temp.path().join(dir)).unwrap();
        }
        // No rpm in the root: the query fails, the binds must still go.
        assert!(DracutPackageInfo::detect(temp.path()).is_err());
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
        assert!(!mountinfo.contains(temp.path().to_str().unwrap()));
    }

    #[test]
    fn serializes_camel_case() {
        let yaml = serde_yaml::to_string(&info("102", "7.azl3")).unwrap();
        assert!(yaml.contains("packageVersion:"));
        assert!(yaml.contains("packageRelease: 7.azl3"));
        let back: DracutPackageInfo = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.package_version, "102");
    }
}
